//! Waste-disposal classification.
//!
//! Maps detector class labels onto the four household sorting streams and
//! attaches a short handling tip. The built-in table covers the labels common
//! detectors emit; deployments can replace it with a TOML catalog.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WasteCategory {
    Recyclable,
    Hazardous,
    Kitchen,
    Other,
}

impl WasteCategory {
    pub const ALL: [WasteCategory; 4] = [
        WasteCategory::Recyclable,
        WasteCategory::Hazardous,
        WasteCategory::Kitchen,
        WasteCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WasteCategory::Recyclable => "recyclable",
            WasteCategory::Hazardous => "hazardous",
            WasteCategory::Kitchen => "kitchen",
            WasteCategory::Other => "other",
        }
    }

    /// Human-readable stream name.
    pub fn label(&self) -> &'static str {
        match self {
            WasteCategory::Recyclable => "Recyclable",
            WasteCategory::Hazardous => "Hazardous waste",
            WasteCategory::Kitchen => "Kitchen waste",
            WasteCategory::Other => "Other waste",
        }
    }

    pub fn bin_color(&self) -> &'static str {
        match self {
            WasteCategory::Recyclable => "blue",
            WasteCategory::Hazardous => "red",
            WasteCategory::Kitchen => "green",
            WasteCategory::Other => "grey",
        }
    }
}

impl fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for WasteCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_name(s).as_str() {
            "recyclable" | "recyclables" | "recycling" => Ok(WasteCategory::Recyclable),
            "hazardous" | "hazardous waste" => Ok(WasteCategory::Hazardous),
            "kitchen" | "kitchen waste" | "food" | "food waste" | "wet" => Ok(WasteCategory::Kitchen),
            "other" | "other waste" | "residual" | "dry" => Ok(WasteCategory::Other),
            other => Err(anyhow!("unknown waste category '{}'", other)),
        }
    }
}

/// What the catalog knows about one label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub display_name: String,
    pub category: WasteCategory,
    pub tips: String,
}

/// A detection enriched with its disposal information.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedDetection {
    pub detection: Detection,
    pub display_name: String,
    /// `None` when the label is not in the catalog.
    pub category: Option<WasteCategory>,
    pub tips: String,
}

impl ClassifiedDetection {
    pub fn category_label(&self) -> &'static str {
        self.category.map(|c| c.label()).unwrap_or("Unknown category")
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    items: Vec<CatalogItem>,
}

#[derive(Deserialize)]
struct CatalogItem {
    name: String,
    display_name: Option<String>,
    category: String,
    #[serde(default)]
    tips: String,
}

const UNKNOWN_TIP: &str = "Unknown category; check your local sorting rules.";

/// Label to disposal-information lookup.
#[derive(Clone, Debug, Default)]
pub struct WasteCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl WasteCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog for common detector labels.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for (name, display_name, category, tips) in BUILTIN {
            catalog.insert(
                name,
                CatalogEntry {
                    display_name: display_name.to_string(),
                    category: *category,
                    tips: tips.to_string(),
                },
            );
        }
        catalog
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw).context("parse waste catalog")?;
        let mut catalog = Self::empty();
        for item in file.items {
            let category = item
                .category
                .parse::<WasteCategory>()
                .with_context(|| format!("catalog item '{}'", item.name))?;
            let display_name = item.display_name.unwrap_or_else(|| item.name.clone());
            catalog.insert(
                &item.name,
                CatalogEntry {
                    display_name,
                    category,
                    tips: item.tips,
                },
            );
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read waste catalog {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn insert(&mut self, name: &str, entry: CatalogEntry) {
        self.entries.insert(normalize_name(name), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive lookup; `_` and `-` count as spaces.
    pub fn lookup(&self, class_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(&normalize_name(class_name))
    }

    pub fn classify(&self, detection: &Detection) -> ClassifiedDetection {
        match self.lookup(&detection.class_name) {
            Some(entry) => ClassifiedDetection {
                detection: detection.clone(),
                display_name: entry.display_name.clone(),
                category: Some(entry.category),
                tips: entry.tips.clone(),
            },
            None => ClassifiedDetection {
                detection: detection.clone(),
                display_name: detection.class_name.clone(),
                category: None,
                tips: UNKNOWN_TIP.to_string(),
            },
        }
    }

    pub fn classify_all(&self, detections: &[Detection]) -> Vec<ClassifiedDetection> {
        detections.iter().map(|d| self.classify(d)).collect()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

use WasteCategory::{Hazardous, Kitchen, Other, Recyclable};

const BUILTIN: &[(&str, &str, WasteCategory, &str)] = &[
    ("bottle", "Plastic bottle", Recyclable, "Empty and rinse, flatten, cap on."),
    ("plastic bottle", "Plastic bottle", Recyclable, "Empty and rinse, flatten, cap on."),
    ("can", "Metal can", Recyclable, "Rinse and crush if possible."),
    ("tin can", "Metal can", Recyclable, "Rinse and crush if possible."),
    ("cardboard", "Cardboard", Recyclable, "Flatten and keep dry."),
    ("paper", "Paper", Recyclable, "Keep clean and dry; no tissues or greasy paper."),
    ("book", "Book", Recyclable, "Donate if usable, otherwise recycle with paper."),
    ("glass", "Glass", Recyclable, "Rinse; wrap broken glass before disposal."),
    ("wine glass", "Wine glass", Recyclable, "Wrap if broken to protect collectors."),
    ("cup", "Cup", Recyclable, "Rinse; paper cups with plastic lining go to other waste."),
    ("fork", "Metal fork", Recyclable, "Metal cutlery is recyclable scrap metal."),
    ("knife", "Metal knife", Recyclable, "Wrap the blade before disposal."),
    ("spoon", "Metal spoon", Recyclable, "Metal cutlery is recyclable scrap metal."),
    ("scissors", "Scissors", Recyclable, "Wrap the blades before disposal."),
    ("bowl", "Bowl", Other, "Ceramic bowls go to other waste; wrap if broken."),
    ("vase", "Vase", Other, "Ceramics are not recyclable with glass."),
    ("battery", "Battery", Hazardous, "Tape the terminals and drop at a battery collection point."),
    ("cell phone", "Mobile phone", Hazardous, "E-waste: return to a take-back or e-waste collection point."),
    ("laptop", "Laptop", Hazardous, "E-waste: wipe data, then use an e-waste collection point."),
    ("keyboard", "Keyboard", Hazardous, "E-waste: use an e-waste collection point."),
    ("mouse", "Computer mouse", Hazardous, "E-waste: remove batteries, then use an e-waste collection point."),
    ("remote", "Remote control", Hazardous, "Remove batteries first; both go to e-waste collection."),
    ("tv", "Television", Hazardous, "Large e-waste: book a collection or return to the retailer."),
    ("light bulb", "Light bulb", Hazardous, "Fluorescent and LED bulbs go to hazardous collection."),
    ("medicine", "Expired medicine", Hazardous, "Keep in the original packaging; pharmacy take-back."),
    ("paint", "Paint", Hazardous, "Seal the container and take to hazardous collection."),
    ("banana", "Banana peel", Kitchen, "Drain liquids; no packaging."),
    ("apple", "Apple core", Kitchen, "Drain liquids; no packaging."),
    ("orange", "Orange peel", Kitchen, "Drain liquids; no packaging."),
    ("broccoli", "Vegetable scraps", Kitchen, "Drain liquids; no packaging."),
    ("carrot", "Vegetable scraps", Kitchen, "Drain liquids; no packaging."),
    ("sandwich", "Leftover food", Kitchen, "Remove wrappers first."),
    ("pizza", "Leftover food", Kitchen, "Greasy boxes go to other waste."),
    ("cake", "Leftover food", Kitchen, "Remove plates and wrappers first."),
    ("donut", "Leftover food", Kitchen, "Remove wrappers first."),
    ("hot dog", "Leftover food", Kitchen, "Remove wrappers first."),
    ("toothbrush", "Toothbrush", Other, "Mixed materials: other waste."),
    ("tissue", "Used tissue", Other, "Soiled paper is not recyclable."),
    ("cigarette", "Cigarette butt", Other, "Extinguish fully before disposal."),
    ("mask", "Face mask", Other, "Fold inward and bag before disposal."),
    ("plastic bag", "Plastic bag", Other, "Reuse where possible; soiled bags are other waste."),
    ("teddy bear", "Soft toy", Other, "Donate if clean, otherwise other waste."),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn detection(name: &str) -> Detection {
        Detection::new(0, name, 0.8, BoundingBox::new(0.0, 0.0, 1.0, 1.0))
    }

    #[test]
    fn builtin_lookup_normalizes_names() {
        let catalog = WasteCatalog::builtin();
        let phone = catalog.classify(&detection("Cell_Phone"));
        assert_eq!(phone.category, Some(WasteCategory::Hazardous));
        assert_eq!(phone.display_name, "Mobile phone");
        assert_eq!(
            catalog.lookup("plastic-bottle").map(|e| e.category),
            Some(WasteCategory::Recyclable)
        );
    }

    #[test]
    fn unknown_labels_have_no_category() {
        let classified = WasteCatalog::builtin().classify(&detection("giraffe"));
        assert_eq!(classified.category, None);
        assert_eq!(classified.display_name, "giraffe");
        assert_eq!(classified.category_label(), "Unknown category");
    }

    #[test]
    fn toml_catalog_parses_and_validates() -> Result<()> {
        let catalog = WasteCatalog::from_toml_str(
            r#"
            [[items]]
            name = "egg_shell"
            display_name = "Egg shell"
            category = "kitchen"
            tips = "Compost."

            [[items]]
            name = "crt"
            category = "Hazardous"
            "#,
        )?;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.lookup("egg shell").map(|e| e.category), Some(WasteCategory::Kitchen));
        assert_eq!(catalog.lookup("CRT").map(|e| e.display_name.as_str()), Some("crt"));

        assert!(WasteCatalog::from_toml_str("[[items]]\nname = \"x\"\ncategory = \"lava\"\n").is_err());
        Ok(())
    }

    #[test]
    fn category_colors() {
        assert_eq!(WasteCategory::Recyclable.bin_color(), "blue");
        assert_eq!(WasteCategory::Hazardous.bin_color(), "red");
        assert_eq!(WasteCategory::Kitchen.bin_color(), "green");
        assert_eq!(WasteCategory::Other.bin_color(), "grey");
        assert_eq!("food".parse::<WasteCategory>().ok(), Some(WasteCategory::Kitchen));
    }
}
