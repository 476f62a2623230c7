//! SMILES to SELFIES translation for chemical language model input.
//!
//! The molecule is parsed into a graph, aromatic rings are kekulized, and the
//! graph is walked depth-first in SMILES order emitting one SELFIES symbol per
//! atom, with `[Branch]` and `[Ring]` symbols followed by their length codes.

use std::collections::HashMap;

use crate::{ModelError, Result};

/// Symbols encoding branch and ring lengths, base 16.
const INDEX_ALPHABET: [&str; 16] = [
    "[C]", "[Ring1]", "[Ring2]", "[Branch1]", "[=Branch1]", "[#Branch1]", "[Branch2]", "[=Branch2]",
    "[#Branch2]", "[O]", "[N]", "[=N]", "[=C]", "[#C]", "[S]", "[P]",
];

fn err(msg: impl Into<String>) -> ModelError {
    ModelError::Smiles(msg.into())
}

#[derive(Debug, Clone, PartialEq)]
struct Atom {
    element: String,
    aromatic: bool,
    isotope: Option<u32>,
    chirality: Option<String>,
    /// Explicit hydrogens; `None` for organic-subset atoms.
    h_count: Option<u32>,
    charge: i32,
}

impl Atom {
    fn organic(element: &str) -> Self {
        let aromatic = element.starts_with(|c: char| c.is_ascii_lowercase());
        Self { element: element.to_string(), aromatic, isotope: None, chirality: None, h_count: None, charge: 0 }
    }

    fn symbol(&self) -> String {
        let h = self.h_count.unwrap_or(0);
        if self.isotope.is_none() && self.chirality.is_none() && h == 0 && self.charge == 0 {
            return self.element.clone();
        }
        let mut s = String::new();
        if let Some(iso) = self.isotope {
            s.push_str(&iso.to_string());
        }
        s.push_str(&self.element);
        if let Some(chi) = &self.chirality {
            s.push_str(chi);
        }
        if h > 0 {
            s.push_str(&format!("H{h}"));
        }
        if self.charge != 0 {
            s.push_str(&format!("{:+}", self.charge));
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl Order {
    fn from_char(c: char) -> Result<Option<Self>> {
        Ok(match c {
            '-' | '/' | '\\' => Some(Self::Single),
            '=' => Some(Self::Double),
            '#' => Some(Self::Triple),
            ':' => Some(Self::Aromatic),
            '$' => return Err(err("quadruple bonds have no SELFIES form")),
            _ => None,
        })
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Double => "=",
            Self::Triple => "#",
            Self::Single | Self::Aromatic => "",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bond {
    a: usize,
    b: usize,
    order: Order,
}

/// One direction of a bond as seen from its source atom.
#[derive(Debug, Clone, Copy)]
struct OutBond {
    dst: usize,
    bond: usize,
    ring: bool,
    stereo: Option<char>,
}

#[derive(Debug, Default)]
struct Molecule {
    atoms: Vec<Atom>,
    bonds: Vec<Bond>,
    /// Outgoing bonds per atom in SMILES order. Tree bonds point away from
    /// the root; ring bonds appear on both ends.
    out: Vec<Vec<Option<OutBond>>>,
    roots: Vec<usize>,
}

impl Molecule {
    fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.out.push(Vec::new());
        self.atoms.len() - 1
    }

    fn implicit_order(&self, a: usize, b: usize) -> Order {
        if self.atoms[a].aromatic && self.atoms[b].aromatic {
            Order::Aromatic
        } else {
            Order::Single
        }
    }

    fn degree(&self, atom: usize) -> usize {
        self.bonds.iter().filter(|b| b.a == atom || b.b == atom).count()
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    smiles: &'a str,
    mol: Molecule,
    prev: Option<usize>,
    bond_char: Option<char>,
    branches: Vec<usize>,
    /// Open ring label -> (atom, placeholder slot, bond char).
    rings: HashMap<u32, (usize, usize, Option<char>)>,
}

impl<'a> Parser<'a> {
    fn new(smiles: &'a str) -> Self {
        Self {
            chars: smiles.char_indices().peekable(),
            smiles,
            mol: Molecule::default(),
            prev: None,
            bond_char: None,
            branches: Vec::new(),
            rings: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<Molecule> {
        while let Some((pos, c)) = self.chars.next() {
            match c {
                '(' => {
                    let prev = self.prev.ok_or_else(|| err(format!("branch without an atom at {pos}")))?;
                    self.branches.push(prev);
                }
                ')' => {
                    self.prev = Some(self.branches.pop().ok_or_else(|| err(format!("unmatched ')' at {pos}")))?);
                }
                '.' => {
                    self.prev = None;
                }
                '-' | '=' | '#' | '$' | ':' | '/' | '\\' => {
                    Order::from_char(c)?;
                    self.bond_char = Some(c);
                }
                '0'..='9' => self.ring(c.to_digit(10).unwrap_or(0), pos)?,
                '%' => {
                    let digits: String = (0..2)
                        .filter_map(|_| self.chars.next_if(|(_, d)| d.is_ascii_digit()))
                        .map(|(_, d)| d)
                        .collect();
                    let label = digits.parse().map_err(|_| err(format!("bad ring label at {pos}")))?;
                    self.ring(label, pos)?;
                }
                '[' => {
                    let atom = self.bracket_atom(pos)?;
                    self.attach(atom)?;
                }
                _ => {
                    let atom = self.organic_atom(c, pos)?;
                    self.attach(atom)?;
                }
            }
        }
        if !self.branches.is_empty() {
            return Err(err(format!("unclosed branch in {}", self.smiles)));
        }
        if let Some(label) = self.rings.keys().next() {
            return Err(err(format!("unclosed ring {label} in {}", self.smiles)));
        }
        if self.bond_char.is_some() {
            return Err(err(format!("dangling bond in {}", self.smiles)));
        }
        if self.mol.atoms.is_empty() {
            return Err(err("empty SMILES"));
        }
        Ok(self.mol)
    }

    fn organic_atom(&mut self, c: char, pos: usize) -> Result<Atom> {
        let element = match c {
            'B' if self.chars.next_if(|(_, n)| *n == 'r').is_some() => "Br",
            'C' if self.chars.next_if(|(_, n)| *n == 'l').is_some() => "Cl",
            'B' => "B",
            'C' => "C",
            'N' => "N",
            'O' => "O",
            'P' => "P",
            'S' => "S",
            'F' => "F",
            'I' => "I",
            'b' => "b",
            'c' => "c",
            'n' => "n",
            'o' => "o",
            'p' => "p",
            's' => "s",
            other => return Err(err(format!("unexpected '{other}' at {pos}"))),
        };
        Ok(Atom::organic(element))
    }

    fn bracket_atom(&mut self, start: usize) -> Result<Atom> {
        let mut body = String::new();
        loop {
            match self.chars.next() {
                Some((_, ']')) => break,
                Some((_, c)) => body.push(c),
                None => return Err(err(format!("unclosed '[' at {start}"))),
            }
        }
        let bad = || err(format!("malformed bracket atom [{body}]"));
        let mut rest = body.as_str();

        let iso_len = rest.chars().take_while(char::is_ascii_digit).count();
        let isotope = if iso_len > 0 { Some(rest[..iso_len].parse().map_err(|_| bad())?) } else { None };
        rest = &rest[iso_len..];

        let element_len = if rest.starts_with("se") || rest.starts_with("as") {
            2
        } else if rest.starts_with(|c: char| c.is_ascii_uppercase()) {
            1 + usize::from(rest[1..].starts_with(|c: char| c.is_ascii_lowercase()))
        } else if rest.starts_with(|c: char| c.is_ascii_lowercase()) {
            1
        } else {
            return Err(bad());
        };
        let element = rest[..element_len].to_string();
        rest = &rest[element_len..];

        let chi_len = rest.chars().take_while(|c| *c == '@').count();
        let chirality = (chi_len > 0).then(|| rest[..chi_len].to_string());
        rest = &rest[chi_len..];

        let mut h_count = 0;
        if let Some(after) = rest.strip_prefix('H') {
            let n = after.chars().take_while(char::is_ascii_digit).count();
            h_count = if n == 0 { 1 } else { after[..n].parse().map_err(|_| bad())? };
            rest = &after[n..];
        }

        let mut charge = 0i32;
        if let Some(sign) = rest.chars().next().filter(|c| *c == '+' || *c == '-') {
            let unit = if sign == '+' { 1 } else { -1 };
            let repeats = rest.chars().take_while(|c| *c == sign).count();
            rest = &rest[repeats..];
            let n = rest.chars().take_while(char::is_ascii_digit).count();
            charge = if n > 0 {
                unit * rest[..n].parse::<i32>().map_err(|_| bad())?
            } else {
                unit * repeats as i32
            };
            rest = &rest[n..];
        }
        // atom class
        if let Some(class) = rest.strip_prefix(':') {
            if !class.chars().all(|c| c.is_ascii_digit()) {
                return Err(bad());
            }
            rest = "";
        }
        if !rest.is_empty() {
            return Err(bad());
        }

        let aromatic = element.starts_with(|c: char| c.is_ascii_lowercase());
        Ok(Atom { element, aromatic, isotope, chirality, h_count: Some(h_count), charge })
    }

    fn attach(&mut self, atom: Atom) -> Result<()> {
        let idx = self.mol.add_atom(atom);
        match self.prev {
            Some(prev) => {
                let c = self.bond_char.take();
                let order = match c.map(Order::from_char).transpose()?.flatten() {
                    Some(o) => o,
                    None => self.mol.implicit_order(prev, idx),
                };
                let bond = self.mol.bonds.len();
                self.mol.bonds.push(Bond { a: prev, b: idx, order });
                let stereo = c.filter(|c| *c == '/' || *c == '\\');
                self.mol.out[prev].push(Some(OutBond { dst: idx, bond, ring: false, stereo }));
            }
            None => {
                if self.bond_char.is_some() {
                    return Err(err(format!("bond without a preceding atom in {}", self.smiles)));
                }
                self.mol.roots.push(idx);
            }
        }
        self.prev = Some(idx);
        Ok(())
    }

    fn ring(&mut self, label: u32, pos: usize) -> Result<()> {
        let cur = self.prev.ok_or_else(|| err(format!("ring label without an atom at {pos}")))?;
        let c = self.bond_char.take();
        match self.rings.remove(&label) {
            None => {
                let slot = self.mol.out[cur].len();
                self.mol.out[cur].push(None);
                self.rings.insert(label, (cur, slot, c));
            }
            Some((open, slot, open_c)) => {
                if open == cur {
                    return Err(err(format!("ring {label} closes on its own atom")));
                }
                let explicit = c.or(open_c).map(Order::from_char).transpose()?.flatten();
                let order = explicit.unwrap_or_else(|| self.mol.implicit_order(open, cur));
                let bond = self.mol.bonds.len();
                self.mol.bonds.push(Bond { a: open, b: cur, order });
                let stereo = |c: Option<char>| c.filter(|c| *c == '/' || *c == '\\');
                self.mol.out[open][slot] = Some(OutBond { dst: cur, bond, ring: true, stereo: stereo(open_c) });
                self.mol.out[cur].push(Some(OutBond { dst: open, bond, ring: true, stereo: stereo(c) }));
            }
        }
        Ok(())
    }
}

/// Whether an aromatic atom must take a double bond in the Kekulé form.
fn needs_double(mol: &Molecule, atom: usize) -> bool {
    let a = &mol.atoms[atom];
    if !a.aromatic {
        return false;
    }
    let exocyclic_double = mol
        .bonds
        .iter()
        .any(|b| (b.a == atom || b.b == atom) && b.order == Order::Double);
    if exocyclic_double {
        return false;
    }
    let h = a.h_count.unwrap_or(0);
    match a.element.as_str() {
        "c" => a.charge == 0,
        "n" | "p" | "as" => a.charge == 1 || (a.charge == 0 && h == 0 && mol.degree(atom) == 2),
        "o" | "s" | "se" => a.charge == 1,
        _ => false,
    }
}

/// Assign alternating single and double bonds to aromatic bonds.
fn kekulize(mol: &mut Molecule) -> Result<()> {
    let n = mol.atoms.len();
    let need: Vec<bool> = (0..n).map(|i| needs_double(mol, i)).collect();
    let mut adj: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    for (idx, b) in mol.bonds.iter().enumerate() {
        if b.order == Order::Aromatic && need[b.a] && need[b.b] {
            adj[b.a].push((b.b, idx));
            adj[b.b].push((b.a, idx));
        }
    }

    let mut mate: Vec<Option<(usize, usize)>> = vec![None; n];
    if !match_from(0, &need, &adj, &mut mate) {
        return Err(err("aromatic system cannot be kekulized"));
    }

    for (idx, bond) in mol.bonds.iter_mut().enumerate() {
        if bond.order == Order::Aromatic {
            let paired = mate[bond.a].is_some_and(|(_, b)| b == idx);
            bond.order = if paired { Order::Double } else { Order::Single };
        }
    }
    for atom in mol.atoms.iter_mut().filter(|a| a.aromatic) {
        atom.aromatic = false;
        let mut chars = atom.element.chars();
        if let Some(first) = chars.next() {
            atom.element = first.to_ascii_uppercase().to_string() + chars.as_str();
        }
    }
    Ok(())
}

/// Backtracking perfect matching over the atoms that need a double bond,
/// trying lower atoms and earlier bonds first.
fn match_from(start: usize, need: &[bool], adj: &[Vec<(usize, usize)>], mate: &mut [Option<(usize, usize)>]) -> bool {
    let Some(atom) = (start..need.len()).find(|&i| need[i] && mate[i].is_none()) else {
        return true;
    };
    for &(other, bond) in &adj[atom] {
        if mate[other].is_some() {
            continue;
        }
        mate[atom] = Some((other, bond));
        mate[other] = Some((atom, bond));
        if match_from(atom + 1, need, adj, mate) {
            return true;
        }
        mate[atom] = None;
        mate[other] = None;
    }
    false
}

fn index_symbols(index: usize) -> Vec<&'static str> {
    if index == 0 {
        return vec![INDEX_ALPHABET[0]];
    }
    let mut symbols = Vec::new();
    let mut rest = index;
    while rest > 0 {
        symbols.push(INDEX_ALPHABET[rest % INDEX_ALPHABET.len()]);
        rest /= INDEX_ALPHABET.len();
    }
    symbols.reverse();
    symbols
}

fn length_code(kind: &str, prefix: &str, index: usize) -> Result<Vec<String>> {
    let q = index_symbols(index);
    if q.len() > 3 {
        return Err(err(format!("{kind} spanning {} symbols is too long", index + 1)));
    }
    let mut out = vec![format!("[{prefix}{kind}{}]", q.len())];
    out.extend(q.into_iter().map(String::from));
    Ok(out)
}

fn atom_prefix(mol: &Molecule, into: Option<&OutBond>) -> &'static str {
    match into {
        None => "",
        Some(ob) => match (mol.bonds[ob.bond].order, ob.stereo) {
            (Order::Single, Some('/')) => "/",
            (Order::Single, Some('\\')) => "\\",
            (order, _) => order.prefix(),
        },
    }
}

fn ring_prefix(mol: &Molecule, closing: &OutBond) -> Result<String> {
    let order = mol.bonds[closing.bond].order;
    let opening = mol.out[closing.dst]
        .iter()
        .flatten()
        .find(|ob| ob.ring && ob.bond == closing.bond)
        .ok_or_else(|| err("ring bond without an opening"))?;
    if order != Order::Single || (opening.stereo.is_none() && closing.stereo.is_none()) {
        return Ok(order.prefix().to_string());
    }
    Ok(format!("{}{}", opening.stereo.unwrap_or('-'), closing.stereo.unwrap_or('-')))
}

fn fragment(mol: &Molecule, root: usize, into_root: Option<OutBond>) -> Result<Vec<String>> {
    let mut derived = Vec::new();
    let (mut curr, mut into) = (root, into_root);
    loop {
        derived.push(format!("[{}{}]", atom_prefix(mol, into.as_ref()), mol.atoms[curr].symbol()));

        let out: Vec<OutBond> = mol.out[curr].iter().flatten().copied().collect();
        let mut next = None;
        for (i, ob) in out.iter().enumerate() {
            if ob.ring {
                if curr < ob.dst {
                    continue;
                }
                let prefix = ring_prefix(mol, ob)?;
                derived.extend(length_code("Ring", &prefix, curr - ob.dst - 1)?);
            } else if i == out.len() - 1 {
                next = Some(*ob);
            } else {
                let branch = fragment(mol, ob.dst, Some(*ob))?;
                derived.extend(length_code("Branch", mol.bonds[ob.bond].order.prefix(), branch.len() - 1)?);
                derived.extend(branch);
            }
        }
        match next {
            Some(ob) => {
                curr = ob.dst;
                into = Some(ob);
            }
            None => return Ok(derived),
        }
    }
}

/// Translate a SMILES string into SELFIES. Dot-separated fragments stay
/// dot-separated.
pub fn smiles_to_selfies(smiles: &str) -> Result<String> {
    let mut mol = Parser::new(smiles.trim()).parse()?;
    kekulize(&mut mol)?;
    let fragments = mol
        .roots
        .iter()
        .map(|&root| fragment(&mol, root, None).map(|symbols| symbols.concat()))
        .collect::<Result<Vec<_>>>()?;
    Ok(fragments.join("."))
}
