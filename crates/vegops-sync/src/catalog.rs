//! Unit-type catalog: maps unit-type codes to their measurement kind.
//! Exactly one kind per type; the external unit-of-measure string is only a
//! fallback for codes the catalog does not list.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use vegops_core::MeasurementKind;

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    unit_types: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    code: String,
    kind: MeasurementKind,
}

#[derive(Debug, Clone)]
pub struct UnitTypeCatalog {
    kinds: BTreeMap<String, MeasurementKind>,
}

impl Default for UnitTypeCatalog {
    fn default() -> Self {
        let mut kinds = BTreeMap::new();
        for (code, kind) in [
            ("TRIM", MeasurementKind::LinearFeet),
            ("SIDE", MeasurementKind::LinearFeet),
            ("OVHG", MeasurementKind::LinearFeet),
            ("MOW", MeasurementKind::Acres),
            ("SPRAY", MeasurementKind::Acres),
            ("BRUSH", MeasurementKind::Acres),
            ("REM", MeasurementKind::Trees),
            ("HAZ", MeasurementKind::Trees),
            ("VINE", MeasurementKind::Trees),
        ] {
            kinds.insert(code.to_string(), kind);
        }
        Self { kinds }
    }
}

impl UnitTypeCatalog {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: CatalogFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut kinds = BTreeMap::new();
        for entry in file.unit_types {
            kinds.insert(entry.code.to_ascii_uppercase(), entry.kind);
        }
        Ok(Self { kinds })
    }

    /// Resolves the measurement kind for a unit type. Catalog entries win;
    /// unknown codes fall back to the record's unit-of-measure string, and
    /// finally to linear feet.
    pub fn kind_for(&self, type_code: &str, unit_of_measure: &str) -> MeasurementKind {
        if let Some(kind) = self.kinds.get(&type_code.to_ascii_uppercase()) {
            return *kind;
        }
        match unit_of_measure.to_ascii_uppercase().as_str() {
            "AC" | "ACRE" | "ACRES" => MeasurementKind::Acres,
            "EA" | "TREE" | "TREES" => MeasurementKind::Trees,
            _ => MeasurementKind::LinearFeet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_catalog_covers_the_builtin_codes() {
        let catalog = UnitTypeCatalog::default();
        assert_eq!(catalog.kind_for("TRIM", ""), MeasurementKind::LinearFeet);
        assert_eq!(catalog.kind_for("mow", ""), MeasurementKind::Acres);
        assert_eq!(catalog.kind_for("HAZ", ""), MeasurementKind::Trees);
    }

    #[test]
    fn unknown_codes_fall_back_to_the_uom() {
        let catalog = UnitTypeCatalog::default();
        assert_eq!(catalog.kind_for("XX", "ACRES"), MeasurementKind::Acres);
        assert_eq!(catalog.kind_for("XX", "EA"), MeasurementKind::Trees);
        assert_eq!(catalog.kind_for("XX", "LF"), MeasurementKind::LinearFeet);
        assert_eq!(catalog.kind_for("XX", ""), MeasurementKind::LinearFeet);
    }

    #[test]
    fn yaml_catalog_overrides_by_code() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "version: 1\nunit_types:\n  - code: widowmaker\n    kind: trees\n  - code: ROW\n    kind: acres\n"
        )
        .unwrap();
        let catalog = UnitTypeCatalog::from_yaml_file(file.path()).unwrap();
        assert_eq!(catalog.kind_for("WIDOWMAKER", ""), MeasurementKind::Trees);
        assert_eq!(catalog.kind_for("row", "LF"), MeasurementKind::Acres);
    }
}
