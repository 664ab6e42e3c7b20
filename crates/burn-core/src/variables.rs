use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::buffer::{BufferError, BufferReader, BufferWriter};
use crate::variant::Variant;

pub const VARIABLE_BUNDLE_ACTION: &str = "WixBundleAction";
pub const VARIABLE_BUNDLE_INSTALLED: &str = "WixBundleInstalled";
pub const VARIABLE_BUNDLE_NAME: &str = "WixBundleName";
pub const VARIABLE_BUNDLE_PROVIDER_KEY: &str = "WixBundleProviderKey";
pub const VARIABLE_BUNDLE_VERSION: &str = "WixBundleVersion";
pub const VARIABLE_BUNDLE_ELEVATED: &str = "WixBundleElevated";
pub const VARIABLE_REBOOT_PENDING: &str = "RebootPending";

const KIND_NONE: u32 = 0;
const KIND_NUMERIC: u32 = 1;
const KIND_STRING: u32 = 2;
const KIND_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable '{0}' is not defined")]
    NotFound(String),
    #[error("variable '{0}' is built-in and cannot be overwritten")]
    BuiltIn(String),
    #[error("unknown serialized variable kind {0}")]
    UnknownKind(u32),
    #[error("failed to decode variables: {0}")]
    Buffer(#[from] BufferError),
}

/// Read access to variables, used by the condition evaluator.
///
/// `Ok(None)` means "not defined"; errors are reserved for lookups that
/// failed for another reason.
pub trait VariableLookup {
    fn lookup(&self, name: &str) -> Result<Option<Variant>, VariableError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VariableEntry {
    value: Variant,
    hidden: bool,
    persisted: bool,
    built_in: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: BTreeMap<String, VariableEntry>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Variant>) -> Result<(), VariableError> {
        let entry = self.entries.entry(name.to_string()).or_default();
        if entry.built_in {
            return Err(VariableError::BuiltIn(name.to_string()));
        }
        entry.value = value.into();
        if entry.hidden {
            debug!(variable = name, "set hidden variable");
        } else {
            debug!(variable = name, value = %entry.value.to_string_value(), "set variable");
        }
        Ok(())
    }

    pub fn set_persisted(
        &mut self,
        name: &str,
        value: impl Into<Variant>,
    ) -> Result<(), VariableError> {
        self.set(name, value)?;
        if let Some(entry) = self.entries.get_mut(name) {
            entry.persisted = true;
        }
        Ok(())
    }

    pub fn set_hidden(&mut self, name: &str, hidden: bool) {
        self.entries.entry(name.to_string()).or_default().hidden = hidden;
    }

    /// Engine-owned values; overwrites any previous value.
    pub fn set_built_in(&mut self, name: &str, value: impl Into<Variant>) {
        let entry = self.entries.entry(name.to_string()).or_default();
        entry.value = value.into();
        entry.built_in = true;
    }

    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.entries.get(name).map(|entry| &entry.value)
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(Variant::to_string_value)
    }

    pub fn get_numeric(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Variant::to_numeric)
    }

    pub fn get_version(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Variant::to_version)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| entry.hidden)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Replaces `[Name]` references with variable values. Undefined
    /// variables format as empty; `[\x]` yields a literal `x`. Brackets that
    /// do not enclose a valid reference are kept verbatim.
    pub fn format(&self, input: &str) -> String {
        let formatted = self.format_with(input, |entry| entry.value.to_string_value());
        if formatted != input {
            debug!(input, formatted = %self.format_for_log(input), "formatted string");
        }
        formatted
    }

    /// Like [`Variables::format`] but masks hidden values, for logging.
    pub fn format_for_log(&self, input: &str) -> String {
        self.format_with(input, |entry| {
            if entry.hidden {
                "*****".to_string()
            } else {
                entry.value.to_string_value()
            }
        })
    }

    fn format_with(&self, input: &str, render: impl Fn(&VariableEntry) -> String) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find('[') {
            output.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            // `[\]]` escapes a closing bracket.
            let close = if after_open.starts_with("\\]") {
                after_open[2..].find(']').map(|index| index + 2)
            } else {
                after_open.find(']')
            };
            let Some(close) = close else {
                output.push_str(&rest[open..]);
                return output;
            };

            let inner = &after_open[..close];
            let mut inner_chars = inner.chars();
            if let (Some('\\'), Some(escaped), None) =
                (inner_chars.next(), inner_chars.next(), inner_chars.next())
            {
                output.push(escaped);
            } else if is_identifier(inner) {
                if let Some(entry) = self.entries.get(inner) {
                    output.push_str(&render(entry));
                }
            } else {
                output.push('[');
                output.push_str(inner);
                output.push(']');
            }
            rest = &after_open[close + 1..];
        }

        output.push_str(rest);
        output
    }

    /// Writes persisted variables only.
    pub fn serialize(&self, writer: &mut BufferWriter) {
        let persisted = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.persisted)
            .collect::<Vec<_>>();
        writer.write_u32(persisted.len() as u32);
        for (name, entry) in persisted {
            writer.write_string(name);
            write_variant(writer, &entry.value);
        }
    }

    /// Restores serialized values; restored variables stay persisted.
    pub fn deserialize(&mut self, reader: &mut BufferReader<'_>) -> Result<(), VariableError> {
        let count = reader.read_u32()?;
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = read_variant(reader)?;
            let entry = self.entries.entry(name).or_default();
            if entry.built_in {
                continue;
            }
            entry.value = value;
            entry.persisted = true;
        }
        Ok(())
    }

    /// Writes every variable, persisted or not. Used to hand the full
    /// variable state to the elevated process before executing a package.
    pub fn serialize_all(&self, writer: &mut BufferWriter) {
        writer.write_u32(self.entries.len() as u32);
        for (name, entry) in &self.entries {
            writer.write_string(name);
            write_variant(writer, &entry.value);
            writer.write_bool(entry.hidden);
        }
    }

    pub fn deserialize_all(reader: &mut BufferReader<'_>) -> Result<Self, VariableError> {
        let count = reader.read_u32()?;
        let mut variables = Self::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = read_variant(reader)?;
            let hidden = reader.read_bool()?;
            variables.entries.insert(
                name,
                VariableEntry {
                    value,
                    hidden,
                    persisted: false,
                    built_in: false,
                },
            );
        }
        Ok(variables)
    }
}

impl VariableLookup for Variables {
    fn lookup(&self, name: &str) -> Result<Option<Variant>, VariableError> {
        Ok(self.get(name).cloned())
    }
}

fn write_variant(writer: &mut BufferWriter, value: &Variant) {
    match value {
        Variant::None => {
            writer.write_u32(KIND_NONE);
        }
        Variant::Numeric(number) => {
            writer.write_u32(KIND_NUMERIC).write_i64(*number);
        }
        Variant::String(text) => {
            writer.write_u32(KIND_STRING).write_string(text);
        }
        Variant::Version(version) => {
            writer.write_u32(KIND_VERSION).write_u64(*version);
        }
    }
}

fn read_variant(reader: &mut BufferReader<'_>) -> Result<Variant, VariableError> {
    match reader.read_u32()? {
        KIND_NONE => Ok(Variant::None),
        KIND_NUMERIC => Ok(Variant::Numeric(reader.read_i64()?)),
        KIND_STRING => Ok(Variant::String(reader.read_string()?)),
        KIND_VERSION => Ok(Variant::Version(reader.read_u64()?)),
        other => Err(VariableError::UnknownKind(other)),
    }
}

pub(crate) fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}
