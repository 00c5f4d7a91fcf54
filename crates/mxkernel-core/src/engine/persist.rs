//! On-disk model format.
//!
//! A model is stored as a single JSON document, either as `model.json`
//! inside a directory or as the same entry inside a zip archive.

use crate::config::PersistConfig;
use crate::error::{KernelError, Result};
use crate::value::{Scalar, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub format_version: u32,
    pub name: String,
    #[serde(default)]
    pub current_space: Option<String>,
    #[serde(default)]
    pub refs: BTreeMap<String, Value>,
    #[serde(default)]
    pub spaces: Vec<SpaceFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceFile {
    pub name: String,
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub cells: Vec<CellsFile>,
    #[serde(default)]
    pub refs: BTreeMap<String, Value>,
    #[serde(default)]
    pub spaces: Vec<SpaceFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellsFile {
    pub name: String,
    pub formula: String,
}

/// Write `model` to `path`.
///
/// The model is staged next to `path` and renamed into place. Without
/// `backup`, an existing target is replaced only when it is itself a saved
/// model.
pub fn save(model: &ModelFile, path: &Path, backup: bool, archive: bool) -> Result<()> {
    check_finite(model)?;
    let text = serde_json::to_string_pretty(model)?;

    if path.exists() && !backup && !is_saved_model(path) {
        return Err(KernelError::Io {
            message: "refusing to replace a target that is not a saved model".to_string(),
            path: Some(path.to_path_buf()),
            source: None,
        });
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| KernelError::io_with_path(e, parent))?;
    }

    let staged = sibling(path, "tmp");
    let written = if archive {
        write_archive(&text, &staged)
    } else {
        write_directory(&text, &staged)
    };
    if let Err(e) = written.and_then(|()| replace(&staged, path, backup)) {
        discard(&staged);
        return Err(e);
    }

    info!("Wrote model {} to {}", model.name, path.display());
    Ok(())
}

/// Read a model from a directory or a zip archive.
pub fn load(path: &Path) -> Result<ModelFile> {
    let text = if path.is_file() {
        read_archive(path)?
    } else {
        let file = path.join(PersistConfig::MODEL_FILE_NAME);
        fs::read_to_string(&file).map_err(|e| KernelError::io_with_path(e, &file))?
    };

    let model: ModelFile = serde_json::from_str(&text).map_err(|e| KernelError::Parse {
        message: format!("invalid model file {}: {}", path.display(), e),
    })?;

    if model.format_version > PersistConfig::FORMAT_VERSION {
        return Err(KernelError::Parse {
            message: format!(
                "model format version {} is newer than supported version {}",
                model.format_version,
                PersistConfig::FORMAT_VERSION
            ),
        });
    }

    debug!("Loaded model {} from {}", model.name, path.display());
    Ok(model)
}

/// Move `staged` onto `path`, backing up or dropping what was there.
fn replace(staged: &Path, path: &Path, backup: bool) -> Result<()> {
    if !path.exists() {
        return rename(staged, path);
    }
    if backup {
        let target = backup_path(path)?;
        rename(path, &target)?;
        info!("Backed up {} to {}", path.display(), target.display());
        return rename(staged, path);
    }

    let previous = sibling(path, "old");
    rename(path, &previous)?;
    if let Err(e) = rename(staged, path) {
        if let Err(restore) = fs::rename(&previous, path) {
            warn!(
                "Failed to restore {} from {}: {}",
                path.display(),
                previous.display(),
                restore
            );
        }
        return Err(e);
    }
    discard(&previous);
    Ok(())
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| KernelError::Io {
        message: format!("Failed to rename {} to {}: {}", from.display(), to.display(), e),
        path: Some(to.to_path_buf()),
        source: Some(e),
    })
}

/// `<path>.<pid>.<tag>`, a scratch name beside `path`.
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.{}", process::id(), tag));
    PathBuf::from(name)
}

fn discard(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = removed {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// A model directory holding `model.json`, or a zip archive with that entry.
fn is_saved_model(path: &Path) -> bool {
    if path.is_dir() {
        return path.join(PersistConfig::MODEL_FILE_NAME).is_file();
    }
    fs::File::open(path)
        .ok()
        .and_then(|file| zip::ZipArchive::new(file).ok())
        .is_some_and(|archive| archive.index_for_name(PersistConfig::MODEL_FILE_NAME).is_some())
}

/// JSON has no spelling for NaN or infinity, so such refs cannot be saved.
fn check_finite(model: &ModelFile) -> Result<()> {
    let qualify = |prefix: &str, name: &str| format!("{}.{}", prefix, name);

    let mut refs: Vec<(String, &Value)> = model
        .refs
        .iter()
        .map(|(name, value)| (qualify(&model.name, name), value))
        .collect();
    let mut spaces: Vec<(String, &SpaceFile)> = model
        .spaces
        .iter()
        .map(|space| (qualify(&model.name, &space.name), space))
        .collect();
    while let Some((prefix, space)) = spaces.pop() {
        refs.extend(space.refs.iter().map(|(name, value)| (qualify(&prefix, name), value)));
        spaces.extend(space.spaces.iter().map(|child| (qualify(&prefix, &child.name), child)));
    }

    for (name, value) in refs {
        if let Some(number) = first_non_finite(value) {
            return Err(KernelError::Serialization {
                message: format!("reference {} holds {}, which cannot be saved", name, number),
            });
        }
    }
    Ok(())
}

fn first_non_finite(value: &Value) -> Option<f64> {
    let mut pending = vec![value];
    while let Some(value) = pending.pop() {
        match value {
            Value::Float(number) if !number.is_finite() => return Some(*number),
            Value::Foreign(foreign) => match foreign.scalar {
                Some(Scalar::Float(number)) if !number.is_finite() => return Some(number),
                _ => {}
            },
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                pending.extend(items)
            }
            Value::Dict(map) => pending.extend(map.values()),
            _ => {}
        }
    }
    None
}

/// First free `<path>_BAK<n>` sibling.
fn backup_path(path: &Path) -> Result<PathBuf> {
    for n in 1..=PersistConfig::MAX_BACKUPS {
        let mut name = path.as_os_str().to_owned();
        name.push(format!("{}{}", PersistConfig::BACKUP_SUFFIX, n));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(KernelError::Io {
        message: format!("no free backup name after {} attempts", PersistConfig::MAX_BACKUPS),
        path: Some(path.to_path_buf()),
        source: None,
    })
}

fn write_directory(text: &str, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| KernelError::io_with_path(e, dir))?;
    let path = dir.join(PersistConfig::MODEL_FILE_NAME);
    let mut file = fs::File::create(&path).map_err(|e| KernelError::io_with_path(e, &path))?;
    file.write_all(text.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| KernelError::io_with_path(e, &path))
}

fn write_archive(text: &str, path: &Path) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| KernelError::io_with_path(e, path))?;

    let archive_error = |e: zip::result::ZipError| KernelError::Archive {
        message: format!("Failed to write zip: {}", e),
        path: path.to_path_buf(),
    };

    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file(
            PersistConfig::MODEL_FILE_NAME,
            zip::write::SimpleFileOptions::default(),
        )
        .map_err(archive_error)?;
    writer
        .write_all(text.as_bytes())
        .map_err(|e| KernelError::io_with_path(e, path))?;
    writer
        .finish()
        .map_err(archive_error)?
        .sync_all()
        .map_err(|e| KernelError::io_with_path(e, path))
}

fn read_archive(path: &Path) -> Result<String> {
    let file = fs::File::open(path).map_err(|e| KernelError::io_with_path(e, path))?;

    let mut archive = zip::ZipArchive::new(file).map_err(|e| KernelError::Archive {
        message: format!("Failed to read zip: {}", e),
        path: path.to_path_buf(),
    })?;

    let mut entry = archive
        .by_name(PersistConfig::MODEL_FILE_NAME)
        .map_err(|e| KernelError::Archive {
            message: format!("Failed to read zip entry: {}", e),
            path: path.to_path_buf(),
        })?;

    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|e| KernelError::io_with_path(e, path))?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ForeignValue;
    use tempfile::TempDir;

    fn sample() -> ModelFile {
        let mut refs = BTreeMap::new();
        refs.insert("rate".to_string(), Value::Float(0.25));
        ModelFile {
            format_version: PersistConfig::FORMAT_VERSION,
            name: "Model1".to_string(),
            current_space: Some("Model1.Space1".to_string()),
            refs,
            spaces: vec![SpaceFile {
                name: "Space1".to_string(),
                bases: Vec::new(),
                cells: vec![CellsFile {
                    name: "foo".to_string(),
                    formula: "def foo(x): return x".to_string(),
                }],
                refs: BTreeMap::new(),
                spaces: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_directory_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        save(&sample(), &path, false, false).unwrap();
        assert!(path.join(PersistConfig::MODEL_FILE_NAME).exists());
        assert_eq!(load(&path).unwrap(), sample());
    }

    #[test]
    fn test_archive_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.zip");
        save(&sample(), &path, false, true).unwrap();
        assert!(path.is_file());
        assert_eq!(load(&path).unwrap(), sample());
    }

    #[test]
    fn test_backup_keeps_previous_target() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        save(&sample(), &path, false, false).unwrap();
        save(&sample(), &path, true, false).unwrap();
        save(&sample(), &path, true, false).unwrap();

        assert!(temp.path().join("model_BAK1").join("model.json").exists());
        assert!(temp.path().join("model_BAK2").join("model.json").exists());
        assert!(path.join("model.json").exists());
    }

    #[test]
    fn test_overwrite_without_backup() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        save(&sample(), &path, false, false).unwrap();
        save(&sample(), &path, false, false).unwrap();
        assert!(!temp.path().join("model_BAK1").exists());
    }

    #[test]
    fn test_overwrite_replaces_previous_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        save(&sample(), &path, false, false).unwrap();

        let mut renamed = sample();
        renamed.name = "Renamed".to_string();
        save(&renamed, &path, false, false).unwrap();
        assert_eq!(load(&path).unwrap(), renamed);

        let zipped = temp.path().join("model.zip");
        save(&sample(), &zipped, false, true).unwrap();
        save(&renamed, &zipped, false, true).unwrap();
        assert_eq!(load(&zipped).unwrap(), renamed);

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 2, "scratch entries left behind: {:?}", leftovers);
    }

    #[test]
    fn test_foreign_directory_is_not_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("notes.txt"), "keep me").unwrap();

        let err = save(&sample(), &path, false, false).unwrap_err();
        assert!(matches!(err, KernelError::Io { .. }));
        assert_eq!(fs::read_to_string(path.join("notes.txt")).unwrap(), "keep me");
        assert!(!path.join(PersistConfig::MODEL_FILE_NAME).exists());
    }

    #[test]
    fn test_foreign_file_is_not_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.zip");
        fs::write(&path, "not an archive").unwrap();

        assert!(save(&sample(), &path, false, true).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "not an archive");
    }

    #[test]
    fn test_backup_moves_foreign_target_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("notes.txt"), "keep me").unwrap();

        save(&sample(), &path, true, false).unwrap();
        let backup = temp.path().join("notes_BAK1").join("notes.txt");
        assert_eq!(fs::read_to_string(backup).unwrap(), "keep me");
        assert_eq!(load(&path).unwrap(), sample());
    }

    #[test]
    fn test_non_finite_refs_are_rejected() {
        let temp = TempDir::new().unwrap();
        for number in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut model = sample();
            model.spaces[0].refs.insert(
                "bad".to_string(),
                Value::List(vec![Value::Int(1), Value::Float(number)]),
            );
            let path = temp.path().join("model");
            let err = save(&model, &path, false, false).unwrap_err();
            assert!(matches!(err, KernelError::Serialization { .. }));
            assert!(err.to_string().contains("Model1.Space1.bad"));
            assert!(!path.exists());
        }

        let mut model = sample();
        model.refs.insert(
            "scalar".to_string(),
            Value::Foreign(
                ForeignValue::new("numpy", "float64", "nan").with_scalar(Scalar::Float(f64::NAN)),
            ),
        );
        assert!(save(&model, &temp.path().join("other"), false, false).is_err());
    }

    #[test]
    fn test_load_missing_path() {
        let temp = TempDir::new().unwrap();
        let err = load(&temp.path().join("absent")).unwrap_err();
        assert!(matches!(err, KernelError::Io { .. }));
    }

    #[test]
    fn test_load_rejects_newer_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        let mut model = sample();
        model.format_version = PersistConfig::FORMAT_VERSION + 1;
        save(&model, &path, false, false).unwrap();
        assert!(matches!(load(&path), Err(KernelError::Parse { .. })));
    }
}
