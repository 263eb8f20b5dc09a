use std::time::Duration;

use unitflow::{Stage, UnitEvent, UnitId, UnitOutcome, UnitState};

use crate::common::{files_under, orchestrator, BatchFixture, ConverterMode, TestCapabilities};

#[tokio::test]
async fn test_cancelled_run_defers_units_and_next_run_resumes() {
    let fixture = BatchFixture::new();
    fixture
        .unit("first", &[("a.pdf", "%PDF")])
        .unit("second", &[("b.pdf", "%PDF")]);
    let caps = TestCapabilities::new(ConverterMode::Faithful);

    let cancelled = orchestrator(caps.capabilities());
    cancelled.cancellation_token().cancel();
    let summary = cancelled
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(summary.deferred, 2);
    assert_eq!(summary.ready, 0);
    assert_eq!(
        summary.outcome_of(&UnitId::new("first")),
        Some(&UnitOutcome::Deferred {
            state: Some(UnitState::Input)
        })
    );
    assert!(fixture.placed("Processing/first/a.pdf").exists());
    assert!(fixture.placed("Processing/second/b.pdf").exists());

    let resumed = orchestrator(caps.capabilities())
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();

    assert_eq!(resumed.ready, 2);
    assert!(fixture.placed("Ready/pdf/first").is_dir());
    assert!(fixture.placed("Ready/pdf/second").is_dir());
}

#[tokio::test]
async fn test_cancel_during_a_stage_lets_the_attempt_commit() {
    let fixture = BatchFixture::new();
    fixture.unit("memo", &[("memo.doc", "memo")]);
    let caps = TestCapabilities::new(ConverterMode::Slow(300));
    let interrupted = orchestrator(caps.capabilities());
    let token = interrupted.cancellation_token();

    let batch = fixture.batch();
    let destination = fixture.destination();
    let (summary, ()) = tokio::join!(
        interrupted.run(&batch, &destination, 3, 2),
        async {
            while caps.converter_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
        }
    );
    let summary = summary.unwrap();

    assert_eq!(summary.deferred, 1);
    assert_eq!(
        summary.outcome_of(&UnitId::new("memo")),
        Some(&UnitOutcome::Deferred {
            state: Some(UnitState::Converted)
        })
    );
    assert_eq!(
        files_under(&fixture.placed("Processing/memo")),
        vec!["memo.docx"]
    );

    let manifest = interrupted
        .inspect(&fixture.destination(), &UnitId::new("memo"))
        .await
        .unwrap();
    assert_eq!(manifest.interrupted_stage(), None);
    assert_eq!(
        manifest.last_event(),
        Some(UnitEvent::completion_of(Stage::Convert))
    );

    let resumed = orchestrator(caps.capabilities())
        .run(&fixture.batch(), &fixture.destination(), 3, 2)
        .await
        .unwrap();
    assert_eq!(resumed.ready, 1);
    assert_eq!(caps.converter_calls(), 1);
    assert!(fixture.placed("Ready/docx/memo/memo.docx").exists());
}
