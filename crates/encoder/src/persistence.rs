//! Directory-based snapshots of an encoder module.
//!
//! A snapshot directory holds two files:
//!
//! * `encoder.safetensors` with the sixteen weights keyed by their
//!   [`WeightName`] and the metadata tensor keyed `head_info`;
//! * `manifest.json` describing the configuration, dtype and the SHA-256
//!   digest of the tensor file.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Component, Path},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::kernel::{EncoderKernel, Precision};
use crate::module::EncoderModule;
use crate::weights::{WeightName, WEIGHT_COUNT};

pub const STATE_FORMAT_VERSION: u32 = 1;
pub const TENSORS_FILENAME: &str = "encoder.safetensors";
pub const MANIFEST_FILENAME: &str = "manifest.json";
/// Key of the metadata tensor inside the tensor file.
pub const METADATA_KEY: &str = "head_info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config: EncoderConfig,
    pub dtype: String,
    pub tensors: FileRecord,
}

/// Writes the module's state into `directory`, creating it if needed.
pub fn save_state<K: EncoderKernel>(
    module: &EncoderModule<K>,
    directory: impl AsRef<Path>,
) -> Result<StateManifest> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory).map_err(|err| {
        EncoderError::persistence(format!(
            "cannot create state directory {}: {err}",
            directory.display()
        ))
    })?;

    let mut named: HashMap<String, Tensor> = HashMap::with_capacity(WEIGHT_COUNT + 1);
    for (name, tensor) in module.weights().iter() {
        named.insert(name.as_str().to_string(), tensor.clone());
    }
    named.insert(METADATA_KEY.to_string(), module.metadata().clone());

    let tensors_path = directory.join(TENSORS_FILENAME);
    safetensors::save(&named, &tensors_path).map_err(|err| {
        EncoderError::persistence(format!(
            "cannot serialise tensors to {}: {err}",
            tensors_path.display()
        ))
    })?;

    let manifest = StateManifest {
        version: STATE_FORMAT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config: *module.config(),
        dtype: module.precision().as_str().to_string(),
        tensors: file_record(&tensors_path)?,
    };
    write_manifest(&directory.join(MANIFEST_FILENAME), &manifest)?;
    log::debug!(
        "encoder state saved to {} ({} bytes, sha256 {})",
        directory.display(),
        manifest.tensors.bytes,
        manifest.tensors.sha256
    );
    Ok(manifest)
}

/// Reads a snapshot written by [`save_state`] and rebuilds the module on `device`.
pub fn load_state(directory: impl AsRef<Path>, device: &Device) -> Result<EncoderModule> {
    let directory = directory.as_ref();
    let manifest = read_manifest(directory)?;
    if manifest.version != STATE_FORMAT_VERSION {
        return Err(EncoderError::persistence(format!(
            "unsupported state format version {} (expected {STATE_FORMAT_VERSION})",
            manifest.version
        )));
    }
    let precision = Precision::from_name(&manifest.dtype).ok_or_else(|| {
        EncoderError::persistence(format!("manifest names unknown dtype '{}'", manifest.dtype))
    })?;

    let filename = Path::new(&manifest.tensors.filename);
    if !matches!(filename.components().collect::<Vec<_>>()[..], [Component::Normal(_)]) {
        return Err(EncoderError::persistence(format!(
            "manifest tensor file '{}' must be a plain file name",
            manifest.tensors.filename
        )));
    }
    let tensors_path = directory.join(filename);
    let digest = sha256_file(&tensors_path)?;
    if digest != manifest.tensors.sha256 {
        return Err(EncoderError::persistence(format!(
            "{} does not match its recorded digest",
            tensors_path.display()
        )));
    }

    let mut named = safetensors::load(&tensors_path, device).map_err(|err| {
        EncoderError::persistence(format!("cannot read {}: {err}", tensors_path.display()))
    })?;
    let mut take = |key: &str| {
        named
            .remove(key)
            .ok_or_else(|| EncoderError::InvalidState(format!("state is missing tensor '{key}'")))
    };
    let mut state = WeightName::ALL
        .into_iter()
        .map(|name| take(name.as_str()))
        .collect::<Result<Vec<_>>>()?;
    let metadata = take(METADATA_KEY)?.to_device(&Device::Cpu).map_err(|err| {
        EncoderError::InvalidState(format!("cannot move metadata to host: {err}"))
    })?;
    if !named.is_empty() {
        let mut extra: Vec<_> = named.into_keys().collect();
        extra.sort();
        return Err(EncoderError::InvalidState(format!(
            "state contains unexpected tensors: {}",
            extra.join(", ")
        )));
    }

    let decoded = EncoderConfig::from_metadata(&metadata)?;
    if decoded != manifest.config {
        return Err(EncoderError::InvalidState(format!(
            "metadata {decoded:?} disagrees with manifest {:?}",
            manifest.config
        )));
    }
    state.push(metadata);

    let module = EncoderModule::from_state(state)?;
    if module.precision() != precision {
        return Err(EncoderError::InvalidState(format!(
            "manifest records {precision} but tensors are {}",
            module.precision()
        )));
    }
    log::debug!("encoder state loaded from {}", directory.display());
    Ok(module)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn file_record(path: &Path) -> Result<FileRecord> {
    let bytes = fs::metadata(path)
        .map_err(|err| EncoderError::persistence(format!("cannot stat {}: {err}", path.display())))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            EncoderError::persistence(format!("non UTF-8 file name {}", path.display()))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|err| EncoderError::persistence(format!("cannot open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut chunk).map_err(|err| {
            EncoderError::persistence(format!("cannot read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_manifest(path: &Path, manifest: &StateManifest) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(manifest)?;
    bytes.push(b'\n');
    File::create(path)
        .and_then(|mut file| file.write_all(&bytes))
        .map_err(|err| EncoderError::persistence(format!("cannot write {}: {err}", path.display())))
}

fn read_manifest(directory: &Path) -> Result<StateManifest> {
    let path = directory.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Err(EncoderError::persistence(format!(
            "no state manifest at {}",
            path.display()
        )));
    }
    let file = File::open(&path)
        .map_err(|err| EncoderError::persistence(format!("cannot open {}: {err}", path.display())))?;
    Ok(serde_json::from_reader(file)?)
}
