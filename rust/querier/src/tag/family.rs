//! Virtual tag families: prefix/suffix dispatch over the tag taxonomy.

use super::{translator::Predicate, TagCategory, TagRegistry};
use crate::{
    encode,
    error::{QuerierError, Result},
    operator::{negate_if, Operator},
};

/// Resource → `l3_device_type` discriminator.
pub const DEVICE_MAP: &[(&str, u32)] = &[
    ("chost", 1),
    ("router", 5),
    ("host", 6),
    ("dhcpgw", 9),
    ("pod", 10),
    ("pod_service", 11),
    ("redis", 12),
    ("rds", 13),
    ("pod_node", 14),
    ("lb", 15),
    ("natgw", 16),
];

/// Resources whose filters never map onto a device type.
const DEVICELESS: &[&str] = &["pod_service"];

pub const TAP_PORT_DEVICE_MAP: &[(&str, u32)] = &[
    ("tap_port_host", 6),
    ("tap_port_chost", 1),
    ("tap_port_pod_node", 14),
];

const MAC_TAGS: &[&str] = &[
    "mac_0",
    "mac_1",
    "tunnel_tx_mac_0",
    "tunnel_tx_mac_1",
    "tunnel_rx_mac_0",
    "tunnel_rx_mac_1",
];

fn device_type(resource: &str) -> Option<u32> {
    DEVICE_MAP
        .iter()
        .find(|(name, _)| *name == resource)
        .map(|(_, value)| *value)
}

/// Splits a trailing `_0`/`_1` device-role suffix.
pub fn split_suffix(name: &str) -> (&str, &'static str) {
    if let Some(stripped) = name.strip_suffix("_0") {
        (stripped, "_0")
    } else if let Some(stripped) = name.strip_suffix("_1") {
        (stripped, "_1")
    } else {
        (name, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    K8sLabel,
    K8sAnnotation,
    K8sEnv,
    CloudTag,
    OsApp,
}

impl Family {
    const ALL: [Family; 5] = [
        Family::K8sLabel,
        Family::K8sAnnotation,
        Family::K8sEnv,
        Family::CloudTag,
        Family::OsApp,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Family::K8sLabel => "k8s.label.",
            Family::K8sAnnotation => "k8s.annotation.",
            Family::K8sEnv => "k8s.env.",
            Family::CloudTag => "cloud.tag.",
            Family::OsApp => "os.app.",
        }
    }

    /// Registry name of the family descriptor, before the role suffix.
    pub fn descriptor(self) -> &'static str {
        match self {
            Family::K8sLabel => "k8s_label",
            Family::K8sAnnotation => "k8s_annotation",
            Family::K8sEnv => "k8s_env",
            Family::CloudTag => "cloud_tag",
            Family::OsApp => "os_app",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualTag {
    Mac,
    TapPort,
    Family {
        family: Family,
        key: String,
        suffix: &'static str,
    },
    Tag {
        key: String,
    },
    Attribute {
        key: String,
    },
    Enum {
        tag: String,
    },
    Device {
        device_type: u32,
        suffix: &'static str,
    },
}

type Matcher = fn(&str) -> Option<VirtualTag>;

/// Evaluated in order; the first match wins.
const ROUTES: &[Matcher] = &[
    match_mac,
    match_tap_port,
    match_family,
    match_tag,
    match_attribute,
    match_enum,
    match_device,
];

fn match_mac(name: &str) -> Option<VirtualTag> {
    MAC_TAGS.contains(&name).then_some(VirtualTag::Mac)
}

fn match_tap_port(name: &str) -> Option<VirtualTag> {
    (name == "tap_port").then_some(VirtualTag::TapPort)
}

fn match_family(name: &str) -> Option<VirtualTag> {
    let (base, suffix) = split_suffix(name);
    Family::ALL.into_iter().find_map(|family| {
        base.strip_prefix(family.prefix())
            .map(|key| VirtualTag::Family {
                family,
                key: key.to_string(),
                suffix,
            })
    })
}

fn match_tag(name: &str) -> Option<VirtualTag> {
    name.strip_prefix("tag.").map(|key| VirtualTag::Tag {
        key: key.to_string(),
    })
}

fn match_attribute(name: &str) -> Option<VirtualTag> {
    name.strip_prefix("attribute.").map(|key| VirtualTag::Attribute {
        key: key.to_string(),
    })
}

fn match_enum(name: &str) -> Option<VirtualTag> {
    name.strip_prefix("Enum(")
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|tag| VirtualTag::Enum {
            tag: tag.trim_matches('`').to_string(),
        })
}

fn match_device(name: &str) -> Option<VirtualTag> {
    let (base, suffix) = split_suffix(name);
    let resource = base.strip_suffix("_id")?;
    if DEVICELESS.contains(&resource) {
        return None;
    }
    device_type(resource).map(|device_type| VirtualTag::Device {
        device_type,
        suffix,
    })
}

impl VirtualTag {
    pub fn classify(name: &str) -> Option<Self> {
        ROUTES.iter().find_map(|matcher| matcher(name))
    }
}

/// Outcome of routing a virtual tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Filter(String),
    /// No family descriptor for this table; emit the raw comparison.
    PassThrough,
    /// `tag.<label>` against metric storage.
    Prometheus { label: String },
    Enum { tag: String },
}

/// Where a routed comparison is compiled.
#[derive(Debug, Clone, Copy)]
pub struct RouteScope<'a> {
    pub tags: &'a TagRegistry,
    pub db: &'a str,
    pub table: &'a str,
    /// Remote read or the Prometheus database.
    pub metric_labels: bool,
}

impl VirtualTag {
    /// Compiles `subject <op> value` for this family.
    pub fn route(&self, scope: RouteScope<'_>, subject: &str, op: Operator, value: &str) -> Result<Routed> {
        match self {
            VirtualTag::Mac => {
                let encoded = encode::encode_macs(subject, op, value)?;
                Ok(Routed::Filter(format!("{subject} {op} {encoded}")))
            }
            VirtualTag::TapPort => {
                let encoded = encode::encode_tap_ports(subject, op, value)?;
                Ok(Routed::Filter(format!("{subject} {op} {encoded}")))
            }
            VirtualTag::Family {
                family,
                key,
                suffix,
            } => {
                let name = format!("{}{suffix}", family.descriptor());
                translate_keyed(scope, &name, subject, key, op, value)
            }
            VirtualTag::Tag { key } if scope.metric_labels => {
                Ok(Routed::Prometheus { label: key.clone() })
            }
            VirtualTag::Tag { key } => translate_keyed(scope, "tag.", subject, key, op, value),
            VirtualTag::Attribute { key } => {
                translate_keyed(scope, "attribute.", subject, key, op, value)
            }
            VirtualTag::Enum { tag } => Ok(Routed::Enum { tag: tag.clone() }),
            VirtualTag::Device {
                device_type,
                suffix,
            } => {
                let positive = op
                    .positive()
                    .compare(&format!("l3_device_id{suffix}"), value);
                Ok(Routed::Filter(negate_if(
                    op,
                    format!("({positive} AND l3_device_type{suffix}={device_type})"),
                )))
            }
        }
    }
}

fn translate_keyed(
    scope: RouteScope<'_>,
    descriptor: &str,
    subject: &str,
    key: &str,
    op: Operator,
    value: &str,
) -> Result<Routed> {
    let Some(descriptor) = scope
        .tags
        .get(descriptor, scope.db, scope.table, TagCategory::Default)
    else {
        return Ok(Routed::PassThrough);
    };

    descriptor
        .translator
        .translate(&Predicate {
            tag: subject,
            key: Some(key),
            op,
            value,
        })
        .map(Routed::Filter)
}

/// Compiles the `exist(<resource>)` tag function.
pub fn exist(scope: RouteScope<'_>, args: &[String]) -> Result<String> {
    let [resource] = args else {
        return Err(QuerierError::InvalidRequest(format!(
            "function exist expects 1 argument, got {}",
            args.len()
        )));
    };

    let resource = resource.trim().trim_matches('`').to_lowercase();
    let (base, suffix) = split_suffix(&resource);
    let resource_no_id = base.strip_suffix("_id").unwrap_or(base);

    if let Some(device_type) = device_type(resource_no_id) {
        if DEVICELESS.contains(&base) {
            return Ok("1=1".to_string());
        }
        return Ok(format!("l3_device_type{suffix}={device_type}"));
    }

    if let Some(VirtualTag::Family {
        family,
        key,
        suffix,
    }) = match_family(&resource)
    {
        let name = format!("{}{suffix}", family.descriptor());
        return Ok(scope
            .tags
            .get(&name, scope.db, scope.table, TagCategory::Default)
            .and_then(|descriptor| descriptor.translator.exists(&key))
            .unwrap_or_else(|| "1=1".to_string()));
    }

    if let Some((_, device_type)) = TAP_PORT_DEVICE_MAP.iter().find(|(name, _)| *name == base) {
        return Ok(format!(
            "(toUInt64(vtap_id),toUInt64(tap_port)) IN (SELECT vtap_id,tap_port FROM flow_tag.vtap_port_map WHERE tap_port!=0 AND device_type={device_type})"
        ));
    }

    Ok("1=1".to_string())
}
