use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use unitflow::config::PipelineConfig;
use unitflow::manifest::{diff_inventory, scan_inventory};
use unitflow::{
    CircuitBreakerManager, DecisionEngine, ExtractionLimits, FsManifestStore, Manifest,
    ManifestStore, ResourcePool, Stage, StageFailure, StageRunner, TypeCatalog, UnitId,
};

use crate::common::{
    archive_listing, files_under, write_file, BatchFixture, ConverterMode, TestCapabilities,
};

fn runner(caps: &TestCapabilities) -> StageRunner {
    let config = PipelineConfig::default();
    StageRunner::new(
        caps.capabilities(),
        Arc::new(DecisionEngine::new(TypeCatalog::from_config(&config.types))),
        Arc::new(CircuitBreakerManager::from_settings(&config.circuit_breakers)),
        ResourcePool::new("converter_slots", 1, Duration::from_secs(1)),
        ExtractionLimits::from(&config.extraction),
    )
}

/// Create the unit's manifest and run classification over it
async fn classified(
    fixture: &BatchFixture,
    runner: &StageRunner,
    name: &str,
) -> (Manifest, PathBuf) {
    let store = FsManifestStore::new(fixture.destination());
    let unit_id = UnitId::new(name);
    let mut manifest = store.create(&unit_id).await.unwrap();
    let unit_dir = store.unit_dir(&unit_id).await.unwrap();

    let completion = runner
        .run(Stage::Classify, &manifest, &unit_dir)
        .await
        .unwrap();
    manifest.inventory = completion.inventory;
    (manifest, unit_dir)
}

#[tokio::test]
async fn test_failed_extraction_leaves_the_unit_as_it_was() {
    let fixture = BatchFixture::new();
    let unit_dir = fixture.placed("Processing/pair");
    write_file(&unit_dir, "a.zip", &archive_listing(&[("a.pdf", "%PDF")]));
    write_file(
        &unit_dir,
        "b.zip",
        &format!("FLAKY\n{}", archive_listing(&[("b.pdf", "%PDF")])),
    );
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let runner = runner(&caps);
    let (manifest, unit_dir) = classified(&fixture, &runner, "pair").await;

    let failed = runner.run(Stage::Extract, &manifest, &unit_dir).await;
    assert!(matches!(
        failed,
        Err(StageFailure::Failed { subject: Some(ref path), permanent: false, .. }) if path == "b.zip"
    ));
    assert_eq!(files_under(&unit_dir), vec!["a.zip", "b.zip"]);
    assert!(!unit_dir.join(".staging").exists());

    let completion = runner
        .run(Stage::Extract, &manifest, &unit_dir)
        .await
        .unwrap();
    assert_eq!(files_under(&unit_dir), vec!["a.zip", "b.zip"]);
    let projected: Vec<&str> = completion
        .inventory
        .iter()
        .map(|entry| entry.path.as_str())
        .collect();
    assert_eq!(projected, vec!["a/a.pdf", "b/b.pdf"]);

    completion.staged.apply(&unit_dir).await.unwrap();
    assert_eq!(files_under(&unit_dir), vec!["a/a.pdf", "b/b.pdf"]);
    assert!(diff_inventory(&completion.inventory, &scan_inventory(&unit_dir).unwrap()).is_empty());
    assert!(!unit_dir.join(".staging").exists());
}

#[tokio::test]
async fn test_conversion_output_stays_staged_until_applied() {
    let fixture = BatchFixture::new();
    let unit_dir = fixture.placed("Processing/memo");
    write_file(&unit_dir, "memo.doc", "memo");
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let runner = runner(&caps);
    let (manifest, unit_dir) = classified(&fixture, &runner, "memo").await;

    let completion = runner
        .run(Stage::Convert, &manifest, &unit_dir)
        .await
        .unwrap();
    assert_eq!(files_under(&unit_dir), vec!["memo.doc"]);
    assert_eq!(completion.inventory.len(), 1);
    assert_eq!(completion.inventory[0].path, "memo.docx");
    assert_eq!(completion.inventory[0].detected_type.as_deref(), Some("docx"));
    assert_eq!(completion.inventory[0].last_modified_stage, Some(Stage::Convert));

    completion.staged.apply(&unit_dir).await.unwrap();
    assert_eq!(files_under(&unit_dir), vec!["memo.docx"]);
}
