use unitflow::{
    FsManifestStore, ManifestMutation, ManifestStore, QuarantineKind, Stage, UnitEvent, UnitId,
    UnitOutcome, UnitState, UnitStateMachine,
};

use crate::common::{
    files_under, orchestrator, write_file, BatchFixture, ConverterMode, ExtensionDetector,
    TestCapabilities,
};

#[tokio::test]
async fn test_interrupted_unit_is_requeued_and_finished() {
    let fixture = BatchFixture::new();
    let unit_dir = fixture.placed("Processing/crashed");
    write_file(&unit_dir, "scan.pdf", "%PDF");

    let store = FsManifestStore::new(fixture.destination());
    let unit_id = UnitId::new("crashed");
    let created = store.create(&unit_id).await.unwrap();
    let machine = UnitStateMachine::new(3).unwrap();
    let started = machine
        .apply(&created.snapshot(), &UnitEvent::StageStarted(Stage::Classify))
        .unwrap();
    store
        .commit(&unit_id, ManifestMutation::new(started))
        .await
        .unwrap();

    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());
    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.recovery.requeued, vec![unit_id.clone()]);
    assert_eq!(summary.ready, 1);
    assert!(fixture.placed("Ready/pdf/crashed").is_dir());

    let manifest = orchestrator
        .inspect(&fixture.destination(), &unit_id)
        .await
        .unwrap();
    assert_eq!(manifest.state, UnitState::Ready);
    assert!(manifest
        .history
        .iter()
        .any(|entry| entry.event == UnitEvent::Recover));
}

#[tokio::test]
async fn test_unit_directory_without_manifest_is_adopted() {
    let fixture = BatchFixture::new();
    write_file(&fixture.placed("Processing/orphan"), "page.pdf", "%PDF");
    let caps = TestCapabilities::new(ConverterMode::Faithful);

    let summary = orchestrator(caps.capabilities())
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.ready, 1);
    assert!(fixture.placed("Ready/pdf/orphan/page.pdf").exists());
}

#[tokio::test]
async fn test_stranded_terminal_unit_counts_as_processed() {
    let fixture = BatchFixture::new();
    fixture.unit("fresh", &[("a.pdf", "%PDF")]);
    let unit_dir = fixture.placed("Processing/stranded");
    std::fs::create_dir_all(&unit_dir).unwrap();

    let store = FsManifestStore::new(fixture.destination());
    let unit_id = UnitId::new("stranded");
    let created = store.create(&unit_id).await.unwrap();
    let machine = UnitStateMachine::new(3).unwrap();
    let classified = machine
        .apply(&created.snapshot(), &UnitEvent::Classify)
        .unwrap();
    let classified = store
        .commit(&unit_id, ManifestMutation::new(classified))
        .await
        .unwrap();
    let quarantined = machine
        .apply(
            &classified.snapshot(),
            &UnitEvent::Quarantine(QuarantineKind::Empty),
        )
        .unwrap();
    store
        .commit(&unit_id, ManifestMutation::new(quarantined))
        .await
        .unwrap();

    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let summary = orchestrator(caps.capabilities())
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.recovery.relocated, vec![unit_id.clone()]);
    assert_eq!(summary.processed, 2);
    assert_eq!(
        summary.processed,
        summary.ready + summary.quarantined() + summary.deferred + summary.aborted
    );
    assert_eq!(
        summary.outcome_of(&unit_id),
        Some(&UnitOutcome::Terminal {
            state: UnitState::Quarantined(QuarantineKind::Empty)
        })
    );
    assert!(fixture.placed("Quarantine/Empty/stranded").is_dir());
}

#[tokio::test]
async fn test_files_appearing_mid_run_are_reconciled_each_time() {
    let fixture = BatchFixture::new();
    fixture.unit("letter", &[("letter.doc", "letter")]);
    let caps = TestCapabilities::new(ConverterMode::Faithful)
        .with_detector(ExtensionDetector::littering(2));
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(
        summary.outcome_of(&UnitId::new("letter")),
        Some(&UnitOutcome::Terminal {
            state: UnitState::Ready
        })
    );
    assert_eq!(
        files_under(&fixture.placed("Ready/pdf/letter")),
        vec!["letter.docx", "stray-1.pdf", "stray-2.pdf"]
    );

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("letter"))
        .await
        .unwrap();
    let recoveries = manifest
        .history
        .iter()
        .filter(|entry| entry.event == UnitEvent::Recover)
        .count();
    assert_eq!(recoveries, 2);
}
