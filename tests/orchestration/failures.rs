use unitflow::{
    ErrorKind, ErrorRecord, FsManifestStore, GuardedOperation, ManifestMutation, ManifestStore,
    PipelineError, QuarantineKind, Stage, UnitEvent, UnitId, UnitOutcome, UnitState,
    UnitStateMachine,
};

use crate::common::{
    archive_listing, fast_config, files_under, orchestrator, orchestrator_with, write_file,
    BatchFixture, ConverterMode, TestCapabilities,
};

#[tokio::test]
async fn test_unsupported_archive_is_quarantined_without_retry() {
    let fixture = BatchFixture::new();
    let listing = format!("UNSUPPORTED\n{}", archive_listing(&[("a.pdf", "%PDF")]));
    fixture.unit("sealed", &[("sealed.zip", listing.as_str())]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.quarantined_as(QuarantineKind::ExtractionFailed), 1);
    assert_eq!(caps.extractor_calls(), 1);
    assert!(fixture.placed("Quarantine/ErExtract/sealed").is_dir());

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("sealed"))
        .await
        .unwrap();
    assert_eq!(
        manifest.state,
        UnitState::Quarantined(QuarantineKind::ExtractionFailed)
    );
    assert_eq!(manifest.errors.len(), 1);
    assert_eq!(manifest.errors[0].kind, ErrorKind::ExtractionFailed);
    assert_eq!(manifest.errors[0].stage, Stage::Extract);
}

#[tokio::test]
async fn test_conversion_that_never_settles_exhausts_cycle_budget() {
    let fixture = BatchFixture::new();
    fixture.unit("loop", &[("memo.doc", "memo")]);
    let caps = TestCapabilities::new(ConverterMode::Stubborn);
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 2, 2)
        .await
        .unwrap();

    assert_eq!(summary.quarantined_as(QuarantineKind::ConversionFailed), 1);
    assert_eq!(caps.converter_calls(), 3);
    assert!(fixture.placed("Quarantine/ErConvert/loop").is_dir());

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("loop"))
        .await
        .unwrap();
    assert_eq!(manifest.cycle_count, 2);
    assert_eq!(
        manifest.state,
        UnitState::Quarantined(QuarantineKind::ConversionFailed)
    );
}

#[tokio::test]
async fn test_transient_conversion_failure_is_retried() {
    let fixture = BatchFixture::new();
    fixture.unit("flaky", &[("memo.doc", "memo")]);
    let caps = TestCapabilities::new(ConverterMode::FlakyFor(1));
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.ready, 1);
    assert_eq!(caps.converter_calls(), 2);

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("flaky"))
        .await
        .unwrap();
    assert_eq!(manifest.errors.len(), 1);
    assert_eq!(manifest.errors[0].kind, ErrorKind::ConversionFailed);
    assert_eq!(manifest.errors[0].attempt, 1);
    assert!(fixture.placed("Ready/docx/flaky").is_dir());
}

#[tokio::test]
async fn test_open_circuit_defers_without_counting_an_attempt() {
    let fixture = BatchFixture::new();
    fixture.unit("waiting", &[("memo.doc", "memo")]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());
    orchestrator
        .circuit_breakers()
        .breaker(GuardedOperation::Conversion)
        .force_open();

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.ready, 1);
    assert_eq!(caps.converter_calls(), 1);

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("waiting"))
        .await
        .unwrap();
    assert!(manifest.errors.is_empty());
    assert!(manifest
        .history
        .iter()
        .any(|entry| entry.event == UnitEvent::StageFailed(Stage::Convert)));
}

#[tokio::test]
async fn test_zero_budgets_are_rejected_before_any_unit_moves() {
    let fixture = BatchFixture::new();
    fixture.unit("untouched", &[("a.pdf", "%PDF")]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());

    let no_workers = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 0)
        .await;
    assert!(matches!(no_workers, Err(PipelineError::Configuration(_))));

    let no_cycles = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 0, 2)
        .await;
    assert!(matches!(no_cycles, Err(PipelineError::Configuration(_))));

    assert!(fixture.batch().join("untouched").join("a.pdf").exists());
}

#[tokio::test]
async fn test_transient_failures_on_different_archives_are_retried_independently() {
    let fixture = BatchFixture::new();
    let first = archive_listing(&[("a.pdf", "%PDF")]);
    let second = format!("FLAKY\n{}", archive_listing(&[("b.pdf", "%PDF")]));
    let third = format!("FLAKY\n{}", archive_listing(&[("c.pdf", "%PDF")]));
    fixture.unit(
        "multi",
        &[
            ("a.zip", first.as_str()),
            ("b.zip", second.as_str()),
            ("c.zip", third.as_str()),
        ],
    );
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(
        summary.outcome_of(&UnitId::new("multi")),
        Some(&UnitOutcome::Terminal {
            state: UnitState::Ready
        })
    );
    // a fails never, b on the first attempt, c on the second
    assert_eq!(caps.extractor_calls(), 8);
    assert_eq!(
        files_under(&fixture.placed("Ready/pdf/multi")),
        vec!["a/a.pdf", "b/b.pdf", "c/c.pdf"]
    );

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("multi"))
        .await
        .unwrap();
    let failures: Vec<(Option<&str>, u32)> = manifest
        .errors
        .iter()
        .map(|record| (record.subject.as_deref(), record.attempt))
        .collect();
    assert_eq!(failures, vec![(Some("b.zip"), 1), (Some("c.zip"), 1)]);
}

#[tokio::test]
async fn test_attempts_recorded_before_a_restart_still_count() {
    let fixture = BatchFixture::new();
    let unit_dir = fixture.placed("Processing/resume");
    write_file(
        &unit_dir,
        "b.zip",
        &format!("FLAKY\n{}", archive_listing(&[("b.pdf", "%PDF")])),
    );

    let store = FsManifestStore::new(fixture.destination());
    let unit_id = UnitId::new("resume");
    let created = store.create(&unit_id).await.unwrap();
    let machine = UnitStateMachine::new(3).unwrap();
    let classified = machine
        .apply(&created.snapshot(), &UnitEvent::Classify)
        .unwrap();
    let typed = created
        .inventory
        .iter()
        .cloned()
        .map(|entry| entry.with_type("zip"))
        .collect();
    let classified = store
        .commit(
            &unit_id,
            ManifestMutation::new(classified).with_inventory(typed),
        )
        .await
        .unwrap();
    let failed = machine
        .apply(&classified.snapshot(), &UnitEvent::StageFailed(Stage::Extract))
        .unwrap();
    store
        .commit(
            &unit_id,
            ManifestMutation::new(failed).with_error(
                ErrorRecord::new(ErrorKind::ExtractionFailed, Stage::Extract, "mount busy", 1)
                    .concerning(Some("b.zip".to_string())),
            ),
        )
        .await
        .unwrap();

    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());
    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.quarantined_as(QuarantineKind::ExtractionFailed), 1);
    assert_eq!(caps.extractor_calls(), 1);

    let manifest = orchestrator
        .inspect(&fixture.destination(), &unit_id)
        .await
        .unwrap();
    assert_eq!(manifest.errors.len(), 2);
    assert_eq!(manifest.errors[1].attempt, 2);
    assert!(fixture.placed("Quarantine/ErExtract/resume/b.zip").exists());
}

#[tokio::test]
async fn test_converter_slot_timeout_is_retried_then_quarantined() {
    let fixture = BatchFixture::new();
    fixture
        .unit("first", &[("memo.doc", "memo")])
        .unit("second", &[("note.doc", "note")]);
    let caps = TestCapabilities::new(ConverterMode::Slow(800));
    let mut config = fast_config();
    config.execution.resource_slots = 1;
    config.execution.resource_acquire_timeout_ms = 20;
    config.error_policy.conversion_failed.max_attempts = 2;
    let orchestrator = orchestrator_with(config, caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.ready, 1);
    assert_eq!(summary.quarantined_as(QuarantineKind::ConversionFailed), 1);
    assert_eq!(caps.converter_calls(), 1);

    let starved = summary
        .units
        .iter()
        .find(|report| {
            report.outcome
                == UnitOutcome::Terminal {
                    state: UnitState::Quarantined(QuarantineKind::ConversionFailed),
                }
        })
        .map(|report| report.unit_id.clone())
        .unwrap();
    let manifest = orchestrator
        .inspect(&fixture.destination(), &starved)
        .await
        .unwrap();
    assert_eq!(manifest.errors.len(), 2);
    assert!(manifest.errors.iter().all(|record| {
        record.kind == ErrorKind::ConversionFailed
            && record.stage == Stage::Convert
            && record.message.contains("converter_slots")
    }));
    assert_eq!(manifest.errors[0].attempt, 1);
    assert_eq!(manifest.errors[1].attempt, 2);
    assert!(fixture
        .placed(&format!("Quarantine/ErConvert/{starved}"))
        .is_dir());
}

#[tokio::test]
async fn test_archive_nesting_deeper_than_the_cycle_budget_is_quarantined() {
    let fixture = BatchFixture::new();
    let listing = archive_listing(&[("b.zip", "c.zip=d.pdf=%PDF")]);
    fixture.unit("nested", &[("a.zip", listing.as_str())]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 2, 2)
        .await
        .unwrap();

    assert_eq!(summary.quarantined_as(QuarantineKind::ConversionFailed), 1);
    assert_eq!(caps.extractor_calls(), 3);
    assert_eq!(
        files_under(&fixture.placed("Quarantine/ErConvert/nested")),
        vec!["a/b/c/d.pdf"]
    );

    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("nested"))
        .await
        .unwrap();
    assert_eq!(manifest.cycle_count, 2);
    assert!(manifest.errors.is_empty());
}

#[tokio::test]
async fn test_archive_nesting_within_the_cycle_budget_settles() {
    let fixture = BatchFixture::new();
    let listing = archive_listing(&[("b.zip", "c.zip=d.pdf=%PDF")]);
    fixture.unit("nested", &[("a.zip", listing.as_str())]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);
    let orchestrator = orchestrator(caps.capabilities());

    let summary = orchestrator
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.ready, 1);
    assert!(fixture.placed("Ready/pdf/nested/a/b/c/d.pdf").exists());
    let manifest = orchestrator
        .inspect(&fixture.destination(), &UnitId::new("nested"))
        .await
        .unwrap();
    assert_eq!(manifest.cycle_count, 3);
}
