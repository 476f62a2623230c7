//! Enumerated dataset, model, and feature options.
//!
//! The string form of every option is what appears on the command line, in
//! dataset directory names and in model keys, so it must never change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

macro_rules! string_options {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CommonError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CommonError::UnknownOption {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_options! {
    /// Benchmark datasets.
    DataOpt, "dataset" {
        Davis => "davis",
        Kiba => "kiba",
        PdbBind => "PDBbind",
        Platinum => "platinum",
    }
}

string_options! {
    /// Model architectures. Prefix letters follow the protein/ligand branch
    /// naming: `D` DGraphDTA-style GCN, `E` protein language model, `C` ChemGPT,
    /// `GVPL` geometric-vector-perceptron ligand branch.
    ModelOpt, "model" {
        Dg => "DG",
        Dgi => "DGI",
        Ed => "ED",
        Eda => "EDA",
        Edi => "EDI",
        Edai => "EDAI",
        Spd => "SPD",
        Cd => "CD",
        Ced => "CED",
        Rng => "RNG",
        Gvp => "GVP",
        Gvpl => "GVPL",
        GvplRng => "GVPL_RNG",
        GvplEsm => "GVPL_ESM",
    }
}

string_options! {
    /// Protein graph edge construction.
    ProEdgeOpt, "protein edge" {
        Simple => "simple",
        Binary => "binary",
        Anm => "anm",
        Af2 => "af2",
        Af2Anm => "af2_anm",
        Ring3 => "ring3",
        Aflow => "aflow",
        AflowRing3 => "aflow_ring3",
    }
}

string_options! {
    /// Protein node features.
    ProFeatOpt, "protein feature" {
        Nomsa => "nomsa",
        Msa => "msa",
        Shannon => "shannon",
        Foldseek => "foldseek",
        Gvp => "gvp",
    }
}

string_options! {
    /// Ligand graph edge construction.
    LigEdgeOpt, "ligand edge" {
        Binary => "binary",
    }
}

string_options! {
    /// Ligand node features.
    LigFeatOpt, "ligand feature" {
        Original => "original",
        Gvp => "gvp",
    }
}

impl ModelOpt {
    /// Models whose protein branch consumes protein-language-model embeddings.
    pub fn uses_protein_lm(&self) -> bool {
        matches!(
            self,
            ModelOpt::Ed
                | ModelOpt::Eda
                | ModelOpt::Edi
                | ModelOpt::Edai
                | ModelOpt::Spd
                | ModelOpt::Ced
                | ModelOpt::GvplEsm
        )
    }

    /// Models whose ligand branch consumes chemical-language-model embeddings.
    pub fn uses_ligand_lm(&self) -> bool {
        matches!(self, ModelOpt::Cd | ModelOpt::Ced)
    }

    /// Models that read the `*.plm.json` split files.
    pub fn uses_pretrained_lm(&self) -> bool {
        self.uses_protein_lm() || self.uses_ligand_lm()
    }

    /// Models whose ligand branch is a GVP network and therefore needs 3D ligand graphs.
    pub fn uses_gvp_ligand(&self) -> bool {
        matches!(self, ModelOpt::Gvpl | ModelOpt::GvplRng | ModelOpt::GvplEsm)
    }

    /// Models whose protein branch is the RING3 edge-attributed attention network.
    pub fn uses_ring3_protein(&self) -> bool {
        matches!(self, ModelOpt::Rng | ModelOpt::GvplRng)
    }
}

impl ProEdgeOpt {
    /// Edge options that need a PDB structure file.
    pub fn requires_structure(&self) -> bool {
        !matches!(self, ProEdgeOpt::Simple | ProEdgeOpt::Binary)
    }

    /// Edge options built from several predicted conformations.
    pub fn requires_conformations(&self) -> bool {
        matches!(
            self,
            ProEdgeOpt::Af2
                | ProEdgeOpt::Af2Anm
                | ProEdgeOpt::Ring3
                | ProEdgeOpt::Aflow
                | ProEdgeOpt::AflowRing3
        )
    }

    /// Edge options that need AlphaFlow conformations.
    pub fn requires_aflow(&self) -> bool {
        matches!(self, ProEdgeOpt::Aflow | ProEdgeOpt::AflowRing3)
    }

    /// Edge options carrying RING3 interaction attributes.
    pub fn requires_ring3(&self) -> bool {
        matches!(self, ProEdgeOpt::Ring3 | ProEdgeOpt::AflowRing3)
    }

    /// Whether edges carry a scalar weight rather than plain connectivity.
    pub fn is_weighted(&self) -> bool {
        !matches!(self, ProEdgeOpt::Binary)
    }
}

impl ProFeatOpt {
    pub fn requires_msa(&self) -> bool {
        matches!(self, ProFeatOpt::Msa | ProFeatOpt::Shannon)
    }

    pub fn requires_structure(&self) -> bool {
        matches!(self, ProFeatOpt::Foldseek | ProFeatOpt::Gvp)
    }
}

impl LigFeatOpt {
    /// Ligand features computed from an SDF conformer.
    pub fn requires_sdf(&self) -> bool {
        matches!(self, LigFeatOpt::Gvp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_display() {
        for opt in ModelOpt::ALL {
            assert_eq!(opt.to_string().parse::<ModelOpt>().unwrap(), *opt);
        }
        for opt in ProEdgeOpt::ALL {
            assert_eq!(opt.as_str().parse::<ProEdgeOpt>().unwrap(), *opt);
        }
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let err = "pdbbind".parse::<DataOpt>().unwrap_err();
        assert!(err.to_string().contains("dataset"));
        assert_eq!("PDBbind".parse::<DataOpt>().unwrap(), DataOpt::PdbBind);
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let json = serde_json::to_string(&ModelOpt::GvplEsm).unwrap();
        assert_eq!(json, "\"GVPL_ESM\"");
        let opt: ProEdgeOpt = serde_json::from_str("\"aflow_ring3\"").unwrap();
        assert_eq!(opt, ProEdgeOpt::AflowRing3);
    }

    #[test]
    fn test_requirement_groups() {
        assert!(ProEdgeOpt::AflowRing3.requires_ring3());
        assert!(ProEdgeOpt::AflowRing3.requires_aflow());
        assert!(!ProEdgeOpt::Anm.requires_conformations());
        assert!(ProEdgeOpt::Anm.requires_structure());
        assert!(!ProEdgeOpt::Binary.requires_structure());
        assert!(ProFeatOpt::Shannon.requires_msa());
        assert!(LigFeatOpt::Gvp.requires_sdf());
        assert!(ModelOpt::GvplEsm.uses_protein_lm());
        assert!(!ModelOpt::Gvpl.uses_protein_lm());
        assert!(ModelOpt::Cd.uses_ligand_lm() && !ModelOpt::Cd.uses_protein_lm());
        assert!(ModelOpt::Cd.uses_pretrained_lm());
        assert!(ModelOpt::Ced.uses_protein_lm() && ModelOpt::Ced.uses_ligand_lm());
    }
}
