//! Batch and destination directories for end-to-end runs

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use unitflow::config::{KindPolicyConfig, PipelineConfig};
use unitflow::{Capabilities, ErrorKind, Orchestrator, RoutingRegistry};

/// A temporary batch root and destination root
pub struct BatchFixture {
    root: TempDir,
}

impl BatchFixture {
    pub fn new() -> Self {
        let root = TempDir::new().expect("create temp root");
        std::fs::create_dir_all(root.path().join("batch")).expect("create batch dir");
        std::fs::create_dir_all(root.path().join("out")).expect("create destination dir");
        Self { root }
    }

    pub fn batch(&self) -> PathBuf {
        self.root.path().join("batch")
    }

    pub fn destination(&self) -> PathBuf {
        self.root.path().join("out")
    }

    /// Write a unit directory with the given files into the batch root
    pub fn unit(&self, name: &str, files: &[(&str, &str)]) -> &Self {
        let dir = self.batch().join(name);
        std::fs::create_dir_all(&dir).expect("create unit dir");
        for (path, content) in files {
            write_file(&dir, path, content);
        }
        self
    }

    /// Path of a unit once placed, relative to the destination root
    pub fn placed(&self, relative: &str) -> PathBuf {
        self.destination().join(relative)
    }
}

pub fn write_file(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, content).expect("write file");
}

/// Archive listing understood by the text extractor
pub fn archive_listing(members: &[(&str, &str)]) -> String {
    members
        .iter()
        .map(|(name, content)| format!("{name}={content}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Defaults with backoff shortened so retries finish quickly
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for kind in ErrorKind::ALL {
        let policy: &mut KindPolicyConfig = config.error_policy.for_kind_mut(kind);
        policy.base_delay_ms = 5;
        policy.max_delay_ms = 20;
    }
    config.circuit_breakers.conversion.cooldown_ms = 50;
    config.circuit_breakers.extraction.cooldown_ms = 50;
    config
}

/// Orchestrator over the standard routing table and [`fast_config`]
pub fn orchestrator(capabilities: Capabilities) -> Orchestrator {
    orchestrator_with(fast_config(), capabilities)
}

pub fn orchestrator_with(config: PipelineConfig, capabilities: Capabilities) -> Orchestrator {
    Orchestrator::new(config, RoutingRegistry::standard().unwrap(), capabilities)
        .expect("valid configuration")
}

/// Sorted relative file paths under `dir`, pipeline files excluded
pub fn files_under(dir: &Path) -> Vec<String> {
    unitflow::manifest::scan_inventory(dir)
        .expect("scan unit dir")
        .into_iter()
        .map(|entry| entry.path)
        .collect()
}
