//! Service-descriptor-backed rendering of gRPC payloads.
//!
//! The descriptor set is loaded once at startup and read-only afterwards;
//! the transfer stage holds it behind an immutable handle.

use std::path::Path;

use ahash::AHashMap;
use prost::Message;
use prost_types::field_descriptor_proto::Type as FieldType;
use prost_types::{DescriptorProto, FileDescriptorSet};

use crate::errors::AgentError;

const MAX_RENDER_DEPTH: usize = 4;
const MAX_RENDER_LEN: usize = 4096;

#[derive(Debug, Clone)]
struct MethodEntry {
    input_type: String,
    output_type: String,
}

/// Indexes a `FileDescriptorSet`: gRPC method paths to message types, and
/// fully-qualified message names to their descriptors.
pub struct ServiceDescriptorDatabase {
    methods: AHashMap<String, MethodEntry>,
    messages: AHashMap<String, DescriptorProto>,
}

impl ServiceDescriptorDatabase {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let bytes = std::fs::read(path).map_err(|e| AgentError::DescriptorLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let set = FileDescriptorSet::decode(bytes.as_slice()).map_err(|e| {
            AgentError::DescriptorLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::from_descriptor_set(set))
    }

    pub fn from_descriptor_set(set: FileDescriptorSet) -> Self {
        let mut methods = AHashMap::new();
        let mut messages = AHashMap::new();
        for file in &set.file {
            let package = file.package.clone().unwrap_or_default();
            for message in &file.message_type {
                index_message(&package, message, &mut messages);
            }
            for service in &file.service {
                let service_name = service.name.clone().unwrap_or_default();
                for method in &service.method {
                    let path = if package.is_empty() {
                        format!("/{}/{}", service_name, method.name())
                    } else {
                        format!("/{}.{}/{}", package, service_name, method.name())
                    };
                    methods.insert(
                        path,
                        MethodEntry {
                            input_type: method.input_type.clone().unwrap_or_default(),
                            output_type: method.output_type.clone().unwrap_or_default(),
                        },
                    );
                }
            }
        }
        Self { methods, messages }
    }

    pub fn method_input_type(&self, path: &str) -> Option<&str> {
        self.methods.get(path).map(|m| m.input_type.as_str())
    }

    pub fn method_output_type(&self, path: &str) -> Option<&str> {
        self.methods.get(path).map(|m| m.output_type.as_str())
    }

    /// Renders one protobuf message of (fully-qualified) `type_name` into a
    /// `field: value` listing. Unknown fields fall back to their numbers;
    /// malformed input yields `None` and the caller degrades to a byte
    /// count.
    pub fn render(&self, type_name: &str, bytes: &[u8]) -> Option<String> {
        let descriptor = self.messages.get(type_name)?;
        let mut out = String::new();
        self.render_fields(descriptor, bytes, 0, &mut out)?;
        Some(out)
    }

    fn render_fields(
        &self,
        descriptor: &DescriptorProto,
        mut bytes: &[u8],
        depth: usize,
        out: &mut String,
    ) -> Option<()> {
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return Some(());
        }
        let mut first = true;
        while !bytes.is_empty() && out.len() < MAX_RENDER_LEN {
            let (tag, n) = decode_varint(bytes)?;
            bytes = &bytes[n..];
            let field_number = (tag >> 3) as i32;
            let wire_type = (tag & 0x7) as u8;
            let field = descriptor
                .field
                .iter()
                .find(|f| f.number() == field_number);
            if !first {
                out.push_str(", ");
            }
            first = false;
            match field {
                Some(f) => out.push_str(f.name()),
                None => out.push_str(&field_number.to_string()),
            }
            out.push_str(": ");
            match wire_type {
                0 => {
                    let (value, n) = decode_varint(bytes)?;
                    bytes = &bytes[n..];
                    match field.map(|f| f.r#type()) {
                        Some(FieldType::Bool) => out.push_str(if value != 0 { "true" } else { "false" }),
                        Some(FieldType::Sint32) | Some(FieldType::Sint64) => {
                            out.push_str(&zigzag(value).to_string())
                        }
                        _ => out.push_str(&value.to_string()),
                    }
                }
                1 => {
                    if bytes.len() < 8 {
                        return None;
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&bytes[..8]);
                    bytes = &bytes[8..];
                    match field.map(|f| f.r#type()) {
                        Some(FieldType::Double) => {
                            out.push_str(&f64::from_le_bytes(b).to_string())
                        }
                        _ => out.push_str(&u64::from_le_bytes(b).to_string()),
                    }
                }
                2 => {
                    let (len, n) = decode_varint(bytes)?;
                    bytes = &bytes[n..];
                    let len = len as usize;
                    if bytes.len() < len {
                        return None;
                    }
                    let value = &bytes[..len];
                    bytes = &bytes[len..];
                    match field.map(|f| f.r#type()) {
                        Some(FieldType::String) => {
                            out.push('"');
                            out.push_str(&String::from_utf8_lossy(value));
                            out.push('"');
                        }
                        Some(FieldType::Message) => {
                            let type_name = field.and_then(|f| f.type_name.as_deref());
                            match type_name.and_then(|t| self.messages.get(t)) {
                                Some(nested) => {
                                    out.push('{');
                                    self.render_fields(nested, value, depth + 1, out)?;
                                    out.push('}');
                                }
                                None => out.push_str(&format!("<{len} bytes>")),
                            }
                        }
                        _ => out.push_str(&format!("<{len} bytes>")),
                    }
                }
                5 => {
                    if bytes.len() < 4 {
                        return None;
                    }
                    let mut b = [0u8; 4];
                    b.copy_from_slice(&bytes[..4]);
                    bytes = &bytes[4..];
                    match field.map(|f| f.r#type()) {
                        Some(FieldType::Float) => out.push_str(&f32::from_le_bytes(b).to_string()),
                        _ => out.push_str(&u32::from_le_bytes(b).to_string()),
                    }
                }
                _ => return None,
            }
        }
        Some(())
    }
}

fn index_message(
    prefix: &str,
    message: &DescriptorProto,
    out: &mut AHashMap<String, DescriptorProto>,
) {
    let name = message.name.clone().unwrap_or_default();
    let full = if prefix.is_empty() {
        format!(".{name}")
    } else {
        format!(".{prefix}.{name}")
    };
    let nested_prefix = full.trim_start_matches('.').to_string();
    for nested in &message.nested_type {
        index_message(&nested_prefix, nested, out);
    }
    out.insert(full, message.clone());
}

fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in buf.iter().enumerate().take(10) {
        value |= ((b & 0x7f) as u64) << (7 * i as u32);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn zigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}
