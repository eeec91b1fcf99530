//! Build functions available to definitions run from the command line.

use std::sync::Arc;

use async_trait::async_trait;
use deriva_lib::buffer::{CompressedBuffer, CompressionMethod};
use deriva_lib::build::{BuildContext, BuildFunction, BuildFunctionRegistry, ValueId};
use uuid::Uuid;

pub const COPY_VERSION: Uuid = Uuid::from_u128(0x1f0c_2b7a_93d4_4e51_8a06_c3e2_57b9_d140);
pub const CONCAT_VERSION: Uuid = Uuid::from_u128(0x7d2e_8c15_06a9_4b3f_9e74_1b5d_c8a0_62f7);

/// Name of the single payload both functions produce.
pub const OUTPUT: &str = "Out";

pub fn output_id() -> ValueId {
  ValueId::from_name(OUTPUT)
}

fn compressed(bytes: Vec<u8>, context: &mut BuildContext<'_>) -> Option<CompressedBuffer> {
  match CompressedBuffer::compress(bytes, CompressionMethod::Deflate) {
    Ok(buffer) => Some(buffer),
    Err(e) => {
      context.add_error("Output", format!("failed to compress output: {}", e));
      None
    }
  }
}

/// Copies input `src` to the output unchanged.
pub struct Copy;

#[async_trait]
impl BuildFunction for Copy {
  fn name(&self) -> &str {
    "Copy"
  }

  fn version(&self) -> Uuid {
    COPY_VERSION
  }

  async fn build(&self, context: &mut BuildContext<'_>) {
    let bytes = match context.input_bytes("src") {
      Some(Ok(bytes)) => bytes,
      Some(Err(e)) => {
        context.add_error("Copy", format!("input 'src' is unreadable: {}", e));
        return;
      }
      None => {
        context.add_error("Copy", "missing input 'src'");
        return;
      }
    };
    if let Some(buffer) = compressed(bytes, context) {
      context.add_payload(output_id(), buffer);
    }
  }
}

/// Joins every input in key order, separated by the optional string constant
/// `separator`.
pub struct Concat;

#[async_trait]
impl BuildFunction for Concat {
  fn name(&self) -> &str {
    "Concat"
  }

  fn version(&self) -> Uuid {
    CONCAT_VERSION
  }

  async fn build(&self, context: &mut BuildContext<'_>) {
    let separator = match context.find_constant("separator") {
      None => Vec::new(),
      Some(value) => match value.as_str() {
        Some(s) => s.as_bytes().to_vec(),
        None => {
          context.add_error("Concat", "constant 'separator' must be a string");
          return;
        }
      },
    };

    let keys: Vec<String> = context.input_keys().into_iter().map(str::to_string).collect();
    let mut joined = Vec::new();
    for (index, key) in keys.iter().enumerate() {
      match context.input_bytes(key) {
        Some(Ok(bytes)) => {
          if index > 0 {
            joined.extend_from_slice(&separator);
          }
          joined.extend(bytes);
        }
        _ => {
          context.add_error("Concat", format!("input '{}' is unreadable", key));
          return;
        }
      }
    }
    if let Some(buffer) = compressed(joined, context) {
      context.add_payload(output_id(), buffer);
    }
  }
}

pub fn registry() -> BuildFunctionRegistry {
  let mut functions = BuildFunctionRegistry::new();
  let builtins: [Arc<dyn BuildFunction>; 2] = [Arc::new(Copy), Arc::new(Concat)];
  for function in builtins {
    // Names and versions are constants, so registration cannot collide.
    let _ = functions.register(function);
  }
  functions
}
