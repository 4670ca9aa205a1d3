//! Tag taxonomy: descriptor registry, alias resolution and virtual families.

pub mod family;
pub mod translator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

pub use family::{Routed, RouteScope, VirtualTag};
pub use translator::{DictionaryLookup, MapScope, Predicate, WhereTranslator};

const ROLE_SUFFIXES: [&str; 3] = ["", "_0", "_1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagCategory {
    #[default]
    Default,
    Enum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub name: String,
    #[serde(default)]
    pub category: TagCategory,
    pub translator: WhereTranslator,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TagKey {
    db: String,
    table: String,
    name: String,
    category: TagCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedName {
    db: String,
    table: String,
    name: String,
}

/// Descriptor registry keyed by `(db, table, name, category)`.
///
/// An empty `table` registers a database-wide entry and an empty `db` a global
/// one; lookups prefer the most specific entry.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    tags: HashMap<TagKey, TagDescriptor>,
    enum_files: HashMap<ScopedName, String>,
    string_enums: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    #[serde(default)]
    tags: Vec<TaxonomyEntry>,
    #[serde(default)]
    enum_descriptions: Vec<EnumDescription>,
    #[serde(default)]
    string_enums: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyEntry {
    #[serde(default)]
    db: String,
    #[serde(default)]
    table: String,
    #[serde(flatten)]
    descriptor: TagDescriptor,
}

#[derive(Debug, Deserialize)]
struct EnumDescription {
    #[serde(default)]
    db: String,
    #[serde(default)]
    table: String,
    tag: String,
    enum_file: String,
}

impl TagRegistry {
    pub fn insert(&mut self, db: &str, table: &str, descriptor: TagDescriptor) {
        let key = TagKey {
            db: db.to_string(),
            table: table.to_string(),
            name: descriptor.name.clone(),
            category: descriptor.category,
        };
        self.tags.insert(key, descriptor);
    }

    pub fn insert_enum_file(&mut self, db: &str, table: &str, tag: &str, enum_file: &str) {
        self.enum_files.insert(
            ScopedName {
                db: db.to_string(),
                table: table.to_string(),
                name: tag.to_string(),
            },
            enum_file.to_string(),
        );
    }

    pub fn mark_string_enum(&mut self, enum_file: &str) {
        self.string_enums.insert(enum_file.to_string());
    }

    pub fn get(&self, name: &str, db: &str, table: &str, category: TagCategory) -> Option<&TagDescriptor> {
        scopes(db, table).into_iter().find_map(|(db, table)| {
            self.tags.get(&TagKey {
                db: db.to_string(),
                table: table.to_string(),
                name: name.to_string(),
                category,
            })
        })
    }

    /// Enum dictionary file describing `tag`, if any.
    pub fn enum_file(&self, tag: &str, db: &str, table: &str) -> Option<&str> {
        scopes(db, table).into_iter().find_map(|(db, table)| {
            self.enum_files
                .get(&ScopedName {
                    db: db.to_string(),
                    table: table.to_string(),
                    name: tag.to_string(),
                })
                .map(String::as_str)
        })
    }

    pub fn is_string_enum(&self, enum_file: &str) -> bool {
        self.string_enums.contains(enum_file)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn extend_from_json(&mut self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tag taxonomy {}", path.display()))?;
        self.extend_from_str(&raw)
            .with_context(|| format!("invalid tag taxonomy {}", path.display()))?;
        info!(path = %path.display(), tags = self.len(), "loaded tag taxonomy");
        Ok(())
    }

    pub fn extend_from_str(&mut self, raw: &str) -> anyhow::Result<()> {
        let file: TaxonomyFile = serde_json::from_str(raw)?;
        for entry in file.tags {
            self.insert(&entry.db, &entry.table, entry.descriptor);
        }
        for description in file.enum_descriptions {
            self.insert_enum_file(
                &description.db,
                &description.table,
                &description.tag,
                &description.enum_file,
            );
        }
        for enum_file in file.string_enums {
            self.mark_string_enum(&enum_file);
        }
        Ok(())
    }

    /// Resolves a tag as written: direct hit, alias target, virtual family, pass-through.
    pub fn resolve(&self, written: &str, db: &str, table: &str, aliases: &AliasMap) -> Resolution<'_> {
        let name = strip_tag(written);
        if let Some(descriptor) = self.get(name, db, table, TagCategory::Default) {
            return Resolution::Descriptor {
                tag: name.to_string(),
                descriptor,
            };
        }

        let canonical = match aliases.resolve(name) {
            Some(target) => {
                let target = strip_tag(target);
                if let Some(descriptor) = self.get(target, db, table, TagCategory::Default) {
                    return Resolution::Descriptor {
                        tag: target.to_string(),
                        descriptor,
                    };
                }
                target
            }
            None => name,
        };

        match VirtualTag::classify(canonical) {
            Some(virtual_tag) => Resolution::Virtual {
                tag: canonical.to_string(),
                virtual_tag,
            },
            None => {
                debug!(tag = name, db, table, "tag not in taxonomy, passing through");
                Resolution::PassThrough
            }
        }
    }

    /// Default taxonomy for the flow tables.
    pub fn builtin() -> Self {
        let mut registry = TagRegistry::default();
        let mut global = |name: String, translator: WhereTranslator| {
            registry.insert(
                "",
                "",
                TagDescriptor {
                    name,
                    category: TagCategory::Default,
                    translator,
                },
            );
        };

        for suffix in ROLE_SUFFIXES {
            global(
                format!("ip{suffix}"),
                WhereTranslator::Ip {
                    ipv4: format!("ip4{suffix}"),
                    ipv6: Some(format!("ip6{suffix}")),
                },
            );
            global(
                format!("nat_real_ip{suffix}"),
                WhereTranslator::Ip {
                    ipv4: format!("nat_real_ip4{suffix}"),
                    ipv6: None,
                },
            );
            global(
                format!("is_internet{suffix}"),
                WhereTranslator::Sentinel {
                    column: format!("l3_epc_id{suffix}"),
                    sentinel: -2,
                },
            );
            for column in ["pod_id", "pod_node_id", "pod_ns_id", "pod_cluster_id", "l3_epc_id", "subnet_id", "region_id", "az_id"] {
                global(format!("{column}{suffix}"), WhereTranslator::column(format!("{column}{suffix}")));
            }
            for (name, lookups) in dictionary_tags(suffix) {
                global(name, WhereTranslator::Dictionary { lookups });
            }
            for (family, scopes) in family_scopes(suffix) {
                global(format!("{family}{suffix}"), WhereTranslator::LabelMap { scopes });
            }
        }

        for direction in ["tx", "rx"] {
            for suffix in ["_0", "_1"] {
                global(
                    format!("tunnel_{direction}_ip{suffix}"),
                    WhereTranslator::Ip {
                        ipv4: format!("tunnel_{direction}_ip4{suffix}"),
                        ipv6: Some(format!("tunnel_{direction}_ip6{suffix}")),
                    },
                );
            }
        }

        global(
            "ip_version".into(),
            WhereTranslator::IpVersion {
                column: "is_ipv4".into(),
            },
        );
        global("_id".into(), WhereTranslator::RowId);
        global(
            "acl_gids".into(),
            WhereTranslator::HasAny {
                column: "acl_gids".into(),
            },
        );
        global(
            "tag.".into(),
            WhereTranslator::KeyValue {
                names: "tag_names".into(),
                values: "tag_values".into(),
            },
        );
        global(
            "attribute.".into(),
            WhereTranslator::KeyValue {
                names: "attribute_names".into(),
                values: "attribute_values".into(),
            },
        );

        for (tag, enum_file, string_keyed) in [
            ("protocol", "protocol.en", false),
            ("l7_protocol", "l7_protocol.en", false),
            ("server_port", "server_port.en", false),
            ("response_status", "response_status.en", false),
            ("tap_side", "tap_side.en", true),
            ("signal_source", "signal_source.en", false),
        ] {
            registry.insert_enum_file("", "", tag, enum_file);
            if string_keyed {
                registry.mark_string_enum(enum_file);
            }
            registry.insert(
                "",
                "",
                TagDescriptor {
                    name: tag.to_string(),
                    category: TagCategory::Enum,
                    translator: WhereTranslator::Enum {
                        column: tag.to_string(),
                    },
                },
            );
        }

        registry
    }
}

fn scopes<'a>(db: &'a str, table: &'a str) -> [(&'a str, &'a str); 3] {
    [(db, table), (db, ""), ("", "")]
}

fn lookup(id_column: String, dictionary: &str, select: &str, match_column: &str, condition: Option<String>) -> DictionaryLookup {
    DictionaryLookup {
        id_column,
        dictionary: dictionary.to_string(),
        match_column: match_column.to_string(),
        select: select.to_string(),
        condition,
    }
}

fn dictionary_tags(s: &str) -> Vec<(String, Vec<DictionaryLookup>)> {
    let device = |device_type: u32, match_column: &str| {
        vec![lookup(
            format!("l3_device_id{s}"),
            "device_map",
            "deviceid",
            match_column,
            Some(format!("devicetype={device_type}")),
        )]
    };

    vec![
        (
            format!("pod_service{s}"),
            vec![lookup(format!("service_id{s}"), "pod_service_map", "id", "name", None)],
        ),
        (
            format!("pod_service_id{s}"),
            vec![lookup(format!("service_id{s}"), "pod_service_map", "id", "id", None)],
        ),
        (
            format!("pod_ingress{s}"),
            vec![
                lookup(format!("pod_ingress_id{s}"), "pod_ingress_map", "id", "name", None),
                lookup(format!("service_id{s}"), "pod_service_map", "id", "pod_ingress_name", None),
            ],
        ),
        (
            format!("pod_ingress_id{s}"),
            vec![
                lookup(format!("pod_ingress_id{s}"), "pod_ingress_map", "id", "id", None),
                lookup(format!("service_id{s}"), "pod_service_map", "id", "pod_ingress_id", None),
            ],
        ),
        (format!("natgw{s}"), device(16, "name")),
        (format!("natgw_id{s}"), device(16, "deviceid")),
        (format!("lb{s}"), device(15, "name")),
        (format!("lb_id{s}"), device(15, "deviceid")),
        (
            format!("lb_listener{s}"),
            vec![lookup(format!("l3_device_id{s}"), "lb_listener_map", "lb_id", "name", None)],
        ),
        (
            format!("lb_listener_id{s}"),
            vec![lookup(format!("l3_device_id{s}"), "lb_listener_map", "lb_id", "id", None)],
        ),
        (
            format!("auto_instance{s}"),
            vec![lookup(format!("auto_instance_id{s}"), "device_map", "deviceid", "name", None)],
        ),
        (
            format!("auto_instance_id{s}"),
            vec![lookup(format!("auto_instance_id{s}"), "device_map", "deviceid", "deviceid", None)],
        ),
        (
            format!("auto_service{s}"),
            vec![lookup(format!("auto_service_id{s}"), "device_map", "deviceid", "name", None)],
        ),
        (
            format!("auto_service_id{s}"),
            vec![lookup(format!("auto_service_id{s}"), "device_map", "deviceid", "deviceid", None)],
        ),
    ]
}

fn scope(id_column: String, table: &str, select: &str, guard: Option<String>) -> MapScope {
    MapScope {
        id_column,
        table: table.to_string(),
        select: select.to_string(),
        guard,
    }
}

fn family_scopes(s: &str) -> Vec<(&'static str, Vec<MapScope>)> {
    vec![
        (
            "k8s_label",
            vec![
                scope(format!("service_id{s}"), "pod_service_k8s_label_map", "id", None),
                scope(format!("pod_id{s}"), "pod_k8s_label_map", "id", None),
            ],
        ),
        (
            "k8s_annotation",
            vec![
                scope(format!("service_id{s}"), "pod_service_k8s_annotation_map", "id", None),
                scope(format!("pod_id{s}"), "pod_k8s_annotation_map", "id", None),
            ],
        ),
        (
            "k8s_env",
            vec![scope(format!("pod_id{s}"), "pod_k8s_env_map", "id", None)],
        ),
        (
            "cloud_tag",
            vec![
                scope(
                    format!("l3_device_id{s}"),
                    "chost_cloud_tag_map",
                    "id",
                    Some(format!("l3_device_type{s}=1")),
                ),
                scope(format!("pod_ns_id{s}"), "pod_ns_cloud_tag_map", "id", None),
            ],
        ),
        (
            "os_app",
            vec![scope(format!("gprocess_id{s}"), "os_app_tag_map", "pid", None)],
        ),
    ]
}

/// Trims whitespace and back-quotes from a tag as written.
pub fn strip_tag(name: &str) -> &str {
    name.trim().trim_matches('`')
}

/// Query alias (`AS` name) → canonical tag. Several aliases may share a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasMap(HashMap<String, String>);

impl AliasMap {
    pub fn insert(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.0.insert(alias.into(), canonical.into());
    }

    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.0.get(alias).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AliasMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        AliasMap(
            iter.into_iter()
                .map(|(alias, canonical)| (alias.into(), canonical.into()))
                .collect(),
        )
    }
}

#[derive(Debug)]
pub enum Resolution<'r> {
    Descriptor {
        tag: String,
        descriptor: &'r TagDescriptor,
    },
    Virtual {
        tag: String,
        virtual_tag: VirtualTag,
    },
    PassThrough,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entries_shadow_wider_scopes() {
        let mut registry = TagRegistry::builtin();
        registry.insert(
            "flow_log",
            "",
            TagDescriptor {
                name: "pod_id".into(),
                category: TagCategory::Default,
                translator: WhereTranslator::column("db_pod"),
            },
        );
        registry.insert(
            "flow_log",
            "l7_flow_log",
            TagDescriptor {
                name: "pod_id".into(),
                category: TagCategory::Default,
                translator: WhereTranslator::column("table_pod"),
            },
        );

        let column = |db: &str, table: &str| {
            let descriptor = registry
                .get("pod_id", db, table, TagCategory::Default)
                .unwrap();
            match &descriptor.translator {
                WhereTranslator::Column { column } => column.clone(),
                other => panic!("unexpected translator {other:?}"),
            }
        };
        assert_eq!(column("flow_log", "l7_flow_log"), "table_pod");
        assert_eq!(column("flow_log", "l4_flow_log"), "db_pod");
        assert_eq!(column("flow_metrics", "vtap_flow_port"), "pod_id");
    }

    #[test]
    fn categories_are_distinct_keys() {
        let registry = TagRegistry::builtin();
        assert!(registry.get("protocol", "flow_log", "l4_flow_log", TagCategory::Enum).is_some());
        assert!(registry.get("protocol", "flow_log", "l4_flow_log", TagCategory::Default).is_none());
        assert_eq!(registry.enum_file("tap_side", "flow_log", "l4_flow_log"), Some("tap_side.en"));
        assert!(registry.is_string_enum("tap_side.en"));
        assert!(!registry.is_string_enum("protocol.en"));
    }

    #[test]
    fn resolution_chain() {
        let registry = TagRegistry::builtin();
        let aliases: AliasMap = [("src_ip", "ip_0"), ("lbl", "`k8s.label.app`")].into_iter().collect();

        assert!(matches!(
            registry.resolve("`ip_1`", "flow_log", "l4_flow_log", &aliases),
            Resolution::Descriptor { ref tag, .. } if tag == "ip_1"
        ));
        assert!(matches!(
            registry.resolve("src_ip", "flow_log", "l4_flow_log", &aliases),
            Resolution::Descriptor { ref tag, .. } if tag == "ip_0"
        ));
        assert!(matches!(
            registry.resolve("lbl", "flow_log", "l4_flow_log", &aliases),
            Resolution::Virtual { ref tag, .. } if tag == "k8s.label.app"
        ));
        assert!(matches!(
            registry.resolve("byte_tx", "flow_log", "l4_flow_log", &aliases),
            Resolution::PassThrough
        ));
    }

    #[test]
    fn loads_taxonomy_from_json() {
        let mut registry = TagRegistry::default();
        registry
            .extend_from_str(
                r#"{
                    "tags": [
                        {"db": "flow_log", "table": "l7_flow_log", "name": "endpoint",
                         "translator": {"kind": "column", "column": "l7_endpoint"}},
                        {"name": "k8s_env", "translator": {"kind": "label_map",
                         "scopes": [{"id_column": "pod_id", "table": "pod_k8s_env_map"}]}}
                    ],
                    "enum_descriptions": [
                        {"db": "flow_log", "table": "l7_flow_log", "tag": "response_code", "enum_file": "response_code.en"}
                    ],
                    "string_enums": ["response_code.en"]
                }"#,
            )
            .unwrap();

        assert!(registry.get("endpoint", "flow_log", "l7_flow_log", TagCategory::Default).is_some());
        assert!(registry.get("endpoint", "flow_log", "l4_flow_log", TagCategory::Default).is_none());
        let env = registry.get("k8s_env", "x", "y", TagCategory::Default).unwrap();
        assert_eq!(
            env.translator,
            WhereTranslator::LabelMap {
                scopes: vec![MapScope {
                    id_column: "pod_id".into(),
                    table: "pod_k8s_env_map".into(),
                    select: "id".into(),
                    guard: None,
                }]
            }
        );
        assert!(registry.is_string_enum("response_code.en"));
    }

    #[test]
    fn rejects_malformed_taxonomy() {
        let mut registry = TagRegistry::default();
        assert!(registry.extend_from_str(r#"{"tags": [{"name": "x"}]}"#).is_err());
    }
}
