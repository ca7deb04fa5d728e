//! Save-on-improvement checkpoint policy.
//!
//! [`BestError`] is a monotone gate: a checkpoint is written only when the
//! reported error is strictly lower than the best seen so far. Directory
//! creation and parameter writing go through a [`CheckpointStore`], and the
//! improvement notice through an [`ImprovementNotifier`], so the gate can be
//! exercised without touching the filesystem.
//!
//! The gate is mutated through `&mut self` only. Sharing a component across
//! threads for checkpointing needs an external lock held by the caller.

use std::path::Path;

use candle_nn::VarMap;

use crate::Result;

/// Initial (worst) error, before any checkpoint.
pub const INITIAL_BEST_ERROR: f64 = 1.0;

/// Where checkpoints go.
pub trait CheckpointStore {
    /// Create `dir` and its parents. Succeeds if it already exists.
    fn ensure_dir(&self, dir: &Path) -> Result<()>;

    /// Persist every parameter in `params` to `path`.
    fn write(&self, params: &VarMap, path: &Path) -> Result<()>;
}

/// Receives a notice whenever a better checkpoint is written.
pub trait ImprovementNotifier {
    fn improved(&self, best_error: f64, path: &Path);
}

/// Safetensors files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsStore;

impl CheckpointStore for SafetensorsStore {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn write(&self, params: &VarMap, path: &Path) -> Result<()> {
        params.save(path)?;
        Ok(())
    }
}

/// Logs improvements at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ImprovementNotifier for TracingNotifier {
    fn improved(&self, best_error: f64, path: &Path) {
        tracing::info!("Saving best error '{best_error}' to '{}'", path.display());
    }
}

/// Best error seen so far, starting at [`INITIAL_BEST_ERROR`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestError(f64);

impl Default for BestError {
    fn default() -> Self {
        Self(INITIAL_BEST_ERROR)
    }
}

impl BestError {
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Write `params` to `path` if `error` beats the best so far.
    ///
    /// Ties do not count. The stored best is only updated once the write has
    /// succeeded, so a failed write leaves the gate unchanged. Returns whether
    /// a checkpoint was written.
    pub fn save_if_improved(
        &mut self,
        error: f64,
        path: &Path,
        params: &VarMap,
        store: &dyn CheckpointStore,
        notifier: &dyn ImprovementNotifier,
    ) -> Result<bool> {
        let improved = error < self.0;
        if !improved {
            return Ok(false);
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            store.ensure_dir(dir)?;
        }
        store.write(params, path)?;
        self.0 = error;
        notifier.improved(error, path);
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    use candle_core::{DType, Device};

    /// Records calls instead of touching the filesystem.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub dirs: RefCell<Vec<PathBuf>>,
        pub writes: RefCell<Vec<PathBuf>>,
    }

    impl CheckpointStore for RecordingStore {
        fn ensure_dir(&self, dir: &Path) -> Result<()> {
            self.dirs.borrow_mut().push(dir.to_path_buf());
            Ok(())
        }

        fn write(&self, _params: &VarMap, path: &Path) -> Result<()> {
            self.writes.borrow_mut().push(path.to_path_buf());
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub notices: RefCell<Vec<f64>>,
    }

    impl ImprovementNotifier for RecordingNotifier {
        fn improved(&self, best_error: f64, _path: &Path) {
            self.notices.borrow_mut().push(best_error);
        }
    }

    struct FailingStore;

    impl CheckpointStore for FailingStore {
        fn ensure_dir(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn write(&self, _params: &VarMap, _path: &Path) -> Result<()> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    #[test]
    fn starts_at_worst() {
        assert_eq!(BestError::default().value(), 1.0);
    }

    #[test]
    fn only_strict_improvements_write() {
        let params = VarMap::new();
        let store = RecordingStore::default();
        let notifier = RecordingNotifier::default();
        let path = Path::new("runs/exp1/encoder.safetensors");
        let mut best = BestError::default();

        assert!(best.save_if_improved(0.5, path, &params, &store, &notifier).unwrap());
        assert!(best.save_if_improved(0.3, path, &params, &store, &notifier).unwrap());
        assert_eq!(best.value(), 0.3);

        assert!(!best.save_if_improved(0.4, path, &params, &store, &notifier).unwrap());
        assert!(!best.save_if_improved(0.3, path, &params, &store, &notifier).unwrap());
        assert_eq!(best.value(), 0.3);

        assert_eq!(store.writes.borrow().len(), 2);
        assert_eq!(store.dirs.borrow()[0], PathBuf::from("runs/exp1"));
        assert_eq!(*notifier.notices.borrow(), vec![0.5, 0.3]);
    }

    #[test]
    fn nan_never_improves() {
        let store = RecordingStore::default();
        let mut best = BestError::default();
        let saved = best
            .save_if_improved(f64::NAN, Path::new("m.safetensors"), &VarMap::new(), &store, &TracingNotifier)
            .unwrap();
        assert!(!saved);
        assert!(store.writes.borrow().is_empty());
    }

    #[test]
    fn failed_write_keeps_previous_best() {
        let mut best = BestError::default();
        let result = best.save_if_improved(
            0.2,
            Path::new("m.safetensors"),
            &VarMap::new(),
            &FailingStore,
            &TracingNotifier,
        );
        assert!(result.is_err());
        assert_eq!(best.value(), 1.0);
    }

    #[test]
    fn safetensors_store_creates_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/model.safetensors");

        let params = VarMap::new();
        params
            .get((2, 3), "w", candle_nn::Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();

        let mut best = BestError::default();
        assert!(best
            .save_if_improved(0.7, &path, &params, &SafetensorsStore, &TracingNotifier)
            .unwrap());
        assert!(path.exists());

        // Directory already present: still fine.
        assert!(best
            .save_if_improved(0.6, &path, &params, &SafetensorsStore, &TracingNotifier)
            .unwrap());
    }
}
