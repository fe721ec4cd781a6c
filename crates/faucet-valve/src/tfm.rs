//! Hardware variants and table-features pipeline negotiation.
//!
//! Most supported switches take the pipeline as programmed. Table-features
//! hardware wants the pipeline declared up front: those variants load a
//! JSON pipeline file and emit a table-features message during switch
//! feature negotiation, cross-checking the file against the configured
//! per-table match restrictions.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use faucet_config::Dp;
use faucet_of::{MatchField, TableFeature};

/// Per-hardware behavior differences. Variants change feature negotiation
/// and a few policy constants, never pipeline semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchVariant {
    /// Hardware that accepts the pipeline as programmed.
    Standard,
    /// Hardware requiring a table-features declaration.
    Tfm,
    /// Aruba: table-features plus no TTL decrement support.
    Aruba,
}

impl SwitchVariant {
    /// Map a hardware model string to its variant; unknown hardware gets
    /// no valve at all.
    pub fn from_hardware(hardware: &str) -> Option<Self> {
        match hardware {
            "Allied-Telesis" | "Lagopus" | "Netronome" | "NoviFlow" | "Open vSwitch"
            | "ZodiacFX" => Some(SwitchVariant::Standard),
            "GenericTFM" => Some(SwitchVariant::Tfm),
            "Aruba" => Some(SwitchVariant::Aruba),
            _ => None,
        }
    }

    /// Whether routed frames get DEC_TTL applied.
    pub fn dec_ttl(&self) -> bool {
        !matches!(self, SwitchVariant::Aruba)
    }

    /// The pipeline declaration file, for table-features variants.
    pub fn pipeline_conf(&self) -> Option<&'static str> {
        match self {
            SwitchVariant::Standard => None,
            SwitchVariant::Tfm => Some("tfm_pipeline.json"),
            SwitchVariant::Aruba => Some("aruba_pipeline.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipelineTableConf {
    table_id: u8,
    name: String,
    #[serde(default)]
    match_types: Vec<String>,
}

/// Load a pipeline declaration file into table-features entries. Unknown
/// match field names are dropped with a log line rather than failing the
/// negotiation.
pub fn load_pipeline(path: &Path) -> std::io::Result<Vec<TableFeature>> {
    let raw = fs::read_to_string(path)?;
    let confs: Vec<PipelineTableConf> = serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut tables = Vec::with_capacity(confs.len());
    for conf in confs {
        let mut match_types = BTreeSet::new();
        for name in &conf.match_types {
            match MatchField::from_name(name) {
                Some(field) => {
                    match_types.insert(field);
                }
                None => info!(table = %conf.name, "ignoring unknown match type {}", name),
            }
        }
        tables.push(TableFeature {
            table_id: conf.table_id,
            name: conf.name,
            match_types,
        });
    }
    Ok(tables)
}

/// Compare the pipeline file's declared match sets against the configured
/// per-table restrictions. Mismatches are informational: the switch decides
/// what it accepts, this only surfaces drift between the two files.
pub fn verify_pipeline_config(dp: &Dp, tfm: &[TableFeature]) {
    for tfm_table in tfm {
        let Some(table) = dp.tables.by_id(tfm_table.table_id) else {
            info!(
                dp_id = format_args!("{:#x}", dp.dp_id),
                "pipeline file declares unknown table {} id {}",
                tfm_table.name,
                tfm_table.table_id
            );
            continue;
        };
        let Some(restricted) = &table.restricted_match_types else {
            continue;
        };
        if &tfm_table.match_types != restricted {
            info!(
                dp_id = format_args!("{:#x}", dp.dp_id),
                "table {} id {} match TFM config {:?} != pipeline {:?}",
                tfm_table.name,
                tfm_table.table_id,
                tfm_table.match_types,
                restricted
            );
        }
    }
}
