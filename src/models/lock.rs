//! Lock record model and key normalization.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Kind of remote repository object that supports an exclusive edit lock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// ABAP class.
    Class,
    /// ABAP interface.
    Interface,
    /// Executable program.
    Program,
    /// Program include.
    Include,
    /// Function group.
    FunctionGroup,
    /// Function module; unique only within its function group.
    FunctionModule,
    /// Transparent table.
    Table,
    /// Dictionary structure.
    Structure,
    /// Data element.
    DataElement,
    /// Domain.
    Domain,
    /// Package.
    Package,
    /// CDS view (DDL source).
    View,
    /// Behavior definition.
    Behavior,
    /// Service definition.
    ServiceDefinition,
    /// Metadata extension.
    MetadataExtension,
}

impl ObjectKind {
    /// All supported kinds, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::Class,
        Self::Interface,
        Self::Program,
        Self::Include,
        Self::FunctionGroup,
        Self::FunctionModule,
        Self::Table,
        Self::Structure,
        Self::DataElement,
        Self::Domain,
        Self::Package,
        Self::View,
        Self::Behavior,
        Self::ServiceDefinition,
        Self::MetadataExtension,
    ];

    /// Canonical storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Program => "program",
            Self::Include => "include",
            Self::FunctionGroup => "function_group",
            Self::FunctionModule => "function_module",
            Self::Table => "table",
            Self::Structure => "structure",
            Self::DataElement => "data_element",
            Self::Domain => "domain",
            Self::Package => "package",
            Self::View => "view",
            Self::Behavior => "behavior",
            Self::ServiceDefinition => "service_definition",
            Self::MetadataExtension => "metadata_extension",
        }
    }

    /// Whether the object name is only unique within a parent container.
    #[must_use]
    pub fn requires_sub_key(self) -> bool {
        matches!(self, Self::FunctionModule)
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "class" | "clas" => Self::Class,
            "interface" | "intf" => Self::Interface,
            "program" | "prog" => Self::Program,
            "include" | "incl" => Self::Include,
            "function_group" | "functiongroup" | "fugr" => Self::FunctionGroup,
            "function_module" | "functionmodule" | "func" | "fm" => Self::FunctionModule,
            "table" | "tabl" => Self::Table,
            "structure" | "stru" => Self::Structure,
            "data_element" | "dataelement" | "dtel" => Self::DataElement,
            "domain" | "doma" => Self::Domain,
            "package" | "devc" => Self::Package,
            "view" | "ddls" => Self::View,
            "behavior" | "behavior_definition" | "bdef" => Self::Behavior,
            "service_definition" | "servicedefinition" | "srvd" => Self::ServiceDefinition,
            "metadata_extension" | "metadataextension" | "ddlx" => Self::MetadataExtension,
            other => {
                return Err(AppError::Config(format!("unsupported object kind: {other}")));
            }
        };
        Ok(kind)
    }
}

/// Normalized registry key for one remote object.
///
/// Names and sub keys are trimmed and upper-cased so the same remote object
/// never maps to two local keys. An empty sub key is treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    /// Object kind.
    pub kind: ObjectKind,
    /// Normalized object name.
    pub name: String,
    /// Normalized parent container name, if the kind needs one.
    pub sub_key: Option<String>,
}

impl LockKey {
    /// Build a normalized key.
    #[must_use]
    pub fn new(kind: ObjectKind, name: &str, sub_key: Option<&str>) -> Self {
        Self {
            kind,
            name: normalize_name(name),
            sub_key: sub_key.map(normalize_name).filter(|s| !s.is_empty()),
        }
    }

    /// Sub key as stored in the registry (`""` when absent).
    #[must_use]
    pub fn sub_key_column(&self) -> &str {
        self.sub_key.as_deref().unwrap_or("")
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.sub_key {
            Some(sub) => write!(f, "{}:{}/{}", self.kind, sub, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// Trim and upper-case a remote object identifier.
#[must_use]
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// One outstanding exclusive lock on a remote object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockRecord {
    /// Object kind.
    pub object_kind: ObjectKind,
    /// Normalized object name.
    pub object_name: String,
    /// Normalized parent container name.
    pub sub_key: Option<String>,
    /// Session that acquired the lock.
    pub session_id: String,
    /// Opaque handle returned by the remote lock call.
    pub lock_handle: String,
    /// Acquisition timestamp.
    pub acquired_at: DateTime<Utc>,
    /// Process that acquired the lock.
    pub owner_pid: u32,
}

impl LockRecord {
    /// Construct a record for `key` acquired now by the current process.
    #[must_use]
    pub fn new(key: &LockKey, session_id: impl Into<String>, lock_handle: impl Into<String>) -> Self {
        Self {
            object_kind: key.kind,
            object_name: key.name.clone(),
            sub_key: key.sub_key.clone(),
            session_id: session_id.into(),
            lock_handle: lock_handle.into(),
            acquired_at: Utc::now(),
            owner_pid: std::process::id(),
        }
    }

    /// Registry key of this record, re-normalized.
    #[must_use]
    pub fn key(&self) -> LockKey {
        LockKey::new(self.object_kind, &self.object_name, self.sub_key.as_deref())
    }
}

/// Shorten a lock handle for display (first 8 characters).
#[must_use]
pub fn truncate_handle(handle: &str) -> String {
    if handle.chars().count() <= 8 {
        handle.to_owned()
    } else {
        let head: String = handle.chars().take(8).collect();
        format!("{head}…")
    }
}
