//! Boot-information records as printed on the console.
//!
//! The harness does not own the record's schema: [`BootRecord`] keeps the
//! decoded JSON as-is and compares it structurally. [`Description`] is a typed
//! view of the multiboot record for callers that want decoding to also check
//! field types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema-agnostic boot-information record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootRecord(Value);

impl BootRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// The `modules` array, if the record carries one.
    pub fn modules(&self) -> Option<&[Value]> {
        self.0.get("modules")?.as_array().map(Vec::as_slice)
    }
}

impl From<Value> for BootRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for BootRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed multiboot boot-information description.
///
/// Fields missing from the JSON default to zero/empty, so the same type
/// decodes both the loader's debug dump and the loaded kernel's report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Description {
    pub status: String,
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub mmap_addr: u32,
    pub mmap_length: u32,
    pub cmdline: String,
    pub bootloader: String,
    pub mmap: Vec<MemoryRegion>,
    pub modules: Vec<Module>,
}

/// One entry of the multiboot memory map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRegion {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    #[serde(rename = "type")]
    pub kind: u32,
}

/// A module handed to the loaded kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Module {
    pub start: u32,
    pub end: u32,
    pub name: String,
    pub cmdline: String,
    pub sha256: String,
}
