//! On-disk form of a compiled program, written by `mythos build` and read
//! back by `mythos run`.
//!
//! The format is a versioned JSON envelope around the serialized
//! `CodeObject` tree. Loading rejects foreign files by magic and newer
//! format versions explicitly, so the layout can evolve.

use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::CodeObject;

pub const MAGIC: &str = "mythos-image";
pub const FORMAT_VERSION: u32 = 1;

/// Conventional extension for built images.
pub const EXTENSION: &str = "mbc";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Not a Mythos image (bad magic)")]
    BadMagic,
    #[error("Unsupported image format version {found}, this build reads {FORMAT_VERSION}")]
    UnsupportedVersion { found: u32 },
    #[error("Malformed image: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Serialize, Deserialize)]
struct Image {
    magic: String,
    format: u32,
    program: Rc<CodeObject>,
}

pub fn encode(program: &Rc<CodeObject>) -> Result<Vec<u8>, ImageError> {
    let image = Image {
        magic: MAGIC.to_string(),
        format: FORMAT_VERSION,
        program: program.clone(),
    };
    Ok(serde_json::to_vec(&image)?)
}

pub fn decode(bytes: &[u8]) -> Result<Rc<CodeObject>, ImageError> {
    let image: Image = serde_json::from_slice(bytes)?;
    if image.magic != MAGIC {
        return Err(ImageError::BadMagic);
    }
    if image.format != FORMAT_VERSION {
        return Err(ImageError::UnsupportedVersion {
            found: image.format,
        });
    }
    Ok(image.program)
}

pub fn save(path: &Path, program: &Rc<CodeObject>) -> Result<(), ImageError> {
    let bytes = encode(program)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Rc<CodeObject>, ImageError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_round_trip() {
        let program = crate::compile("function f(a) { return a * 2 }\nprint(f(21))\n")
            .expect("compile should succeed");
        let bytes = encode(&program).expect("encode should succeed");
        let loaded = decode(&bytes).expect("decode should succeed");
        assert_eq!(*loaded, *program);
    }

    #[test]
    fn rejects_foreign_and_future_images() {
        let err = decode(br#"{"magic":"elsewhere","format":1,"program":null}"#)
            .expect_err("bad magic should fail");
        assert!(matches!(err, ImageError::Malformed(_) | ImageError::BadMagic));

        let program = crate::compile("x = 1\n").expect("compile should succeed");
        let mut image: serde_json::Value =
            serde_json::from_slice(&encode(&program).unwrap()).unwrap();
        image["format"] = serde_json::json!(99);
        let err = decode(image.to_string().as_bytes()).expect_err("future version should fail");
        assert!(matches!(
            err,
            ImageError::UnsupportedVersion { found: 99 }
        ));
    }

    #[test]
    fn loaded_images_run_identically() {
        use crate::builtins::{Console, Registry};
        use crate::vm::Vm;

        let program = crate::compile("s = \"\"\nfor i in range(1, 4) { s = s + string(i) }\nprint(s)\n")
            .expect("compile should succeed");
        let bytes = encode(&program).expect("encode should succeed");
        let loaded = decode(&bytes).expect("decode should succeed");

        let console = Console::capture();
        let mut vm = Vm::new(Registry::standard(&console));
        vm.run(&loaded).expect("run should succeed");
        assert_eq!(console.captured(), vec!["123".to_string()]);
    }
}
