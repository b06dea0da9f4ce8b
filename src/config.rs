// Settings keys and defaults.
// The settings table is plain key/value; the field mapping is stored as a
// JSON object (logical field name -> data source name on the label template).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SETTING_FIELD_MAPPING: &str = "field_mapping";
pub const SETTING_TEMPLATE_ROOT: &str = "template_root";
pub const SETTING_BACKUP_PATH: &str = "backup_path";
pub const SETTING_DEFAULT_PRINTER: &str = "default_printer";

/// Logical field -> template data-source name used when the settings row is
/// missing or unparseable. These names match the data sources on the stock
/// label templates.
pub fn default_field_mapping() -> BTreeMap<String, String> {
    [
        ("name", "mingcheng"),
        ("spec", "guige"),
        ("model", "xinghao"),
        ("color", "yanse"),
        ("sn4", "SN4"),
        ("sku", "SKU"),
        ("code69", "69"),
        ("box_no", "xianghao"),
        ("qty", "shuliang"),
        ("weight", "zhongliang"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Resolve a product's template file against the configured template root.
/// A template stored as an absolute path wins over the root.
pub fn resolve_template_path(root: Option<&str>, template: &str) -> PathBuf {
    let template_path = Path::new(template);
    if template_path.is_absolute() {
        return template_path.to_path_buf();
    }
    match root {
        Some(r) if !r.is_empty() => Path::new(r).join(template_path),
        _ => template_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping_covers_box_fields() {
        let m = default_field_mapping();
        assert_eq!(m.get("box_no").map(String::as_str), Some("xianghao"));
        assert_eq!(m.get("code69").map(String::as_str), Some("69"));
        assert_eq!(m.len(), 10);
    }

    #[test]
    fn test_resolve_template_path() {
        let p = resolve_template_path(Some("/srv/templates"), "widget.btw");
        assert_eq!(p, PathBuf::from("/srv/templates/widget.btw"));

        let p = resolve_template_path(None, "widget.btw");
        assert_eq!(p, PathBuf::from("widget.btw"));

        let p = resolve_template_path(Some("/srv/templates"), "/abs/widget.btw");
        assert_eq!(p, PathBuf::from("/abs/widget.btw"));
    }
}
