mod common;

use common::{
    CLEARED, FakeAuthority, FlakyRepository, NOT_CLEARED, REPORTED, Reply, harness, invoice,
    pipeline_with, self_signed, signing_key, store_with_certificate, tenant,
};
use fatoora_pipeline::{
    canon::{self, Digest},
    config::Environment,
    invoice::{InvoiceKind, sign::SignatureKind},
    pipeline::{Cancellation, PipelineError, PipelineState, ReportingState},
    repository::InvoiceRepository,
    retry::RecordingSleeper,
    store::CertificateStore,
};
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn first_invoice_clears_and_becomes_chain_head() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(
        vec![Reply::Status(200, CLEARED)],
        vec![Reply::Status(200, REPORTED)],
    );
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );

    let record = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("cleared");

    assert_eq!(record.state(), PipelineState::Cleared);
    assert_eq!(record.signature_kind(), Some(SignatureKind::Real));
    assert!(!record.unsigned_xml().expect("unsigned").contains("PIH"));
    let digest = *record.digest().expect("digest");
    assert_eq!(
        canon::document_digest(record.unsigned_xml().expect("unsigned")).expect("digest"),
        digest
    );
    let states: Vec<_> = record.history().iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        [
            PipelineState::Created,
            PipelineState::PolicyChecked,
            PipelineState::DocumentBuilt,
            PipelineState::Hashed,
            PipelineState::Signed,
            PipelineState::Submitted,
            PipelineState::Cleared,
        ]
    );

    let sent = authority.clearance_calls();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].invoice_hash, digest.to_base64());

    // Sandbox allows reporting, so the cleared invoice is reported as well.
    assert_eq!(
        record.reporting().map(|r| r.state),
        Some(ReportingState::Reported)
    );
    assert_eq!(
        h.pipeline
            .chain()
            .get_chain_head(&tenant(), Environment::Sandbox)
            .await
            .expect("head"),
        Some(digest)
    );
}

#[tokio::test]
async fn second_invoice_links_to_the_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(
        vec![Reply::Status(200, CLEARED), Reply::Status(200, CLEARED)],
        vec![Reply::Status(200, REPORTED), Reply::Status(200, REPORTED)],
    );
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority,
    );
    let first = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("first");
    let head = *first.digest().expect("digest");

    let second = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 2, Some(head)),
            &Cancellation::never(),
        )
        .await
        .expect("second");
    assert_eq!(second.previous_digest(), Some(&head));
    assert!(second.unsigned_xml().expect("xml").contains(&head.to_hex()));
    assert_eq!(
        h.repository
            .get_last_cleared_digest(&tenant(), Environment::Sandbox)
            .await
            .expect("head"),
        second.digest().copied()
    );
}

#[tokio::test]
async fn broken_chain_fails_without_network_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );
    let bogus: Digest = canon::digest(b"not the head");

    let err = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, Some(bogus)),
            &Cancellation::never(),
        )
        .await
        .expect_err("broken chain");

    let PipelineError::ChainIntegrity(err) = err else {
        panic!("expected chain integrity error, got {err:?}");
    };
    assert_eq!(err.head, None);
    assert_eq!(err.declared, Some(bogus));
    assert_eq!(authority.network_calls(), 0);
    assert!(h.repository.is_empty());
}

#[tokio::test]
async fn production_simplified_clearance_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Production),
        authority.clone(),
    );

    let err = h
        .pipeline
        .submit(
            invoice(Environment::Production, InvoiceKind::Simplified, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect_err("policy");

    assert!(matches!(err, PipelineError::PolicyViolation(_)));
    assert!(err.is_pre_network());
    assert_eq!(authority.network_calls(), 0);
    assert!(h.repository.is_empty());
}

#[tokio::test]
async fn production_standard_is_cleared_but_not_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![Reply::Status(200, CLEARED)], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Production),
        authority.clone(),
    );

    let record = h
        .pipeline
        .submit(
            invoice(Environment::Production, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("cleared");
    assert!(record.is_cleared());
    assert!(record.reporting().is_none());
    assert_eq!(authority.reporting_calls(), 0);
}

#[tokio::test]
async fn missing_certificate_means_signing_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(CertificateStore::open(dir.path()).expect("store"), authority.clone());

    let err = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect_err("no certificate");
    assert!(matches!(err, PipelineError::SigningUnavailable(_)), "{err:?}");
    assert_eq!(authority.network_calls(), 0);
}

#[tokio::test]
async fn expired_certificate_is_not_used() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CertificateStore::open(dir.path()).expect("store");
    let cert = self_signed(signing_key(), 7, Duration::from_secs(3));
    store
        .upload(
            &tenant(),
            Environment::Sandbox,
            common::certificate_pem(&cert).as_bytes(),
            common::key_pem(signing_key()).as_bytes(),
        )
        .expect("upload");
    tokio::time::sleep(Duration::from_millis(3100)).await;

    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(store, authority.clone());
    let err = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect_err("expired");
    assert!(matches!(err, PipelineError::SigningUnavailable(_)), "{err:?}");
    assert_eq!(authority.network_calls(), 0);
}

#[tokio::test]
async fn reporting_failure_keeps_the_invoice_cleared() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(
        vec![Reply::Status(200, CLEARED)],
        vec![Reply::Rejected(r#"{"reportingStatus":"NOT_REPORTED"}"#)],
    );
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority,
    );

    let record = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Simplified, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("cleared");
    assert_eq!(record.state(), PipelineState::Cleared);
    let reporting = record.reporting().expect("reporting result");
    assert_eq!(reporting.state, ReportingState::ReportFailed);

    let stored = h
        .repository
        .get_invoice(&tenant(), Environment::Sandbox, record.uuid())
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored, record);
    assert_eq!(
        h.repository
            .get_last_cleared_digest(&tenant(), Environment::Sandbox)
            .await
            .expect("head"),
        record.digest().copied()
    );
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(
        vec![
            Reply::Timeout,
            Reply::Timeout,
            Reply::Timeout,
            Reply::Status(200, CLEARED),
        ],
        vec![Reply::Status(200, REPORTED)],
    );
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );

    let record = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("cleared");
    assert!(record.is_cleared());
    assert_eq!(authority.clearance_calls().len(), 4);
    assert_eq!(h.sleeper.delays().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_submission() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![Reply::Timeout; 4], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );
    let invoice = invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None);
    let uuid = invoice.uuid();

    let err = h
        .pipeline
        .submit(invoice, &Cancellation::never())
        .await
        .expect_err("exhausted");
    let PipelineError::SubmissionFailed { attempts, .. } = err else {
        panic!("expected submission failure, got {err:?}");
    };
    assert_eq!(attempts, 4);

    let stored = h
        .repository
        .get_invoice(&tenant(), Environment::Sandbox, uuid)
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored.state(), PipelineState::Failed);
    assert!(stored.failure().is_some());
    assert_eq!(
        h.repository
            .get_last_cleared_digest(&tenant(), Environment::Sandbox)
            .await
            .expect("head"),
        None
    );
}

#[tokio::test]
async fn rejection_is_recorded_verbatim_and_does_not_advance_the_chain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![Reply::Rejected(NOT_CLEARED)], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority,
    );

    let record = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("rejected record");
    assert_eq!(record.state(), PipelineState::Rejected);
    let rejection = record.rejection().expect("rejection");
    assert_eq!(rejection.status, 400);
    assert!(rejection.reason.contains("BR-KSA-26"));
    assert!(record.reporting().is_none());
    assert_eq!(
        h.pipeline
            .chain()
            .get_chain_head(&tenant(), Environment::Sandbox)
            .await
            .expect("head"),
        None
    );
}

#[tokio::test]
async fn duplicate_uuid_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(
        vec![Reply::Status(200, CLEARED)],
        vec![Reply::Status(200, REPORTED)],
    );
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );
    let invoice = invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None);
    h.pipeline
        .submit(invoice.clone(), &Cancellation::never())
        .await
        .expect("first");

    let err = h
        .pipeline
        .submit(invoice, &Cancellation::never())
        .await
        .expect_err("duplicate");
    assert!(matches!(err, PipelineError::AlreadySubmitted { .. }), "{err:?}");
    assert_eq!(authority.clearance_calls().len(), 1);
}

#[tokio::test]
async fn cancelled_before_submission_leaves_no_trace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );
    let (handle, cancel) = Cancellation::pair();
    handle.cancel();

    let err = h
        .pipeline
        .submit(
            invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
            &cancel,
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            state: PipelineState::Created
        }
    ));
    assert_eq!(authority.network_calls(), 0);
    assert!(h.repository.is_empty());
}

#[tokio::test]
async fn waiting_for_a_busy_chain_can_be_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![], vec![]);
    let h = harness(
        store_with_certificate(dir.path(), Environment::Sandbox),
        authority.clone(),
    );
    let _held = h.pipeline.chain().lock(&tenant(), Environment::Sandbox).await;
    let (handle, cancel) = Cancellation::pair();

    let submit = h.pipeline.submit(
        invoice(Environment::Sandbox, InvoiceKind::Standard, 1, None),
        &cancel,
    );
    let (result, ()) = tokio::join!(submit, async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });
    assert!(matches!(
        result,
        Err(PipelineError::Cancelled {
            state: PipelineState::PolicyChecked
        })
    ));
    assert_eq!(authority.network_calls(), 0);
}

#[tokio::test]
async fn cleared_outcome_survives_a_failed_save() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![Reply::Status(200, CLEARED)], vec![]);
    // Save 1 records Submitted; save 2 is the first attempt at the outcome.
    let repository = FlakyRepository::failing_saves([2]);
    let pipeline = pipeline_with(
        store_with_certificate(dir.path(), Environment::Production),
        authority.clone(),
        repository.clone(),
        Arc::new(RecordingSleeper::new()),
    );

    let record = pipeline
        .submit(
            invoice(Environment::Production, InvoiceKind::Standard, 1, None),
            &Cancellation::never(),
        )
        .await
        .expect("cleared");

    assert!(record.is_cleared());
    assert_eq!(repository.saves(), 3);
    assert_eq!(authority.clearance_calls().len(), 1);
    assert_eq!(
        repository
            .get_last_cleared_digest(&tenant(), Environment::Production)
            .await
            .expect("head"),
        record.digest().copied()
    );
}

#[tokio::test]
async fn unsaved_clearance_is_handed_back_for_reconciliation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let authority = FakeAuthority::new(vec![Reply::Status(200, CLEARED)], vec![]);
    let repository = FlakyRepository::failing_saves(2..=10);
    let pipeline = pipeline_with(
        store_with_certificate(dir.path(), Environment::Production),
        authority.clone(),
        repository.clone(),
        Arc::new(RecordingSleeper::new()),
    );
    let invoice = invoice(Environment::Production, InvoiceKind::Standard, 1, None);
    let uuid = invoice.uuid();

    let err = pipeline
        .submit(invoice, &Cancellation::never())
        .await
        .expect_err("not persisted");

    assert!(!err.is_pre_network());
    let PipelineError::ClearedButNotPersisted { record, .. } = err else {
        panic!("expected an unsaved clearance, got {err:?}");
    };
    assert_eq!(record.uuid(), uuid);
    assert_eq!(record.state(), PipelineState::Cleared);
    assert!(record.signed_xml().is_some());
    assert_eq!(
        record.digest().map(Digest::to_base64),
        Some(authority.clearance_calls()[0].invoice_hash.clone())
    );
    // The chain head did not move, and the stored record still says Submitted.
    assert_eq!(
        repository
            .get_last_cleared_digest(&tenant(), Environment::Production)
            .await
            .expect("head"),
        None
    );
    let stored = repository
        .get_invoice(&tenant(), Environment::Production, uuid)
        .await
        .expect("lookup")
        .expect("submitted record");
    assert_eq!(stored.state(), PipelineState::Submitted);
}
