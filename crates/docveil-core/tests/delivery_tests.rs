//! Integration tests for the end-to-end delivery flow.
//!
//! Tests cover:
//!  1. Issue → redeem with live session → marked PDF, success audit
//!  2. Redeem after revocation → NoSession + violation audit
//!  3. Expired capability → Expired + violation audit
//!  4. Forged signature → InvalidSignature + violation audit
//!  5. Path traversal and extension rejection
//!  6. Missing document → NotFound
//!  7. Sealed document delivery through the vault
//!  8. PNG delivery covert-marked and traced back to the subject
//!  9. Trace of an unmarked image is a clean negative
//! 10. Scratch copy purged after the delivery is dropped

use std::io::Cursor;
use std::sync::Arc;

use docveil_core::{
    parse_signed_url, CapabilityClaims, DeliveryEngine, DocumentVault, EngineConfig,
    HeuristicClassifier, InMemoryDirectory, MemoryAuditSink, MemorySessionStore, RejectReason,
    RequestContext, SigningSecret, SilentAnnouncer, StreamRequest, ThreatLevel, VaultKey,
};
use lopdf::{dictionary, Document, Object, Stream};
use tempfile::TempDir;

struct Fixture {
    engine: DeliveryEngine,
    audit: Arc<MemoryAuditSink>,
    library: std::path::PathBuf,
    _dirs: TempDir,
}

/// Minimal valid PDF with `page_count` empty pages.
fn sample_pdf(page_count: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for _ in 0..page_count {
        let content_id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ],
            "Contents" => Object::Reference(content_id),
        });
        kids.push(Object::Reference(page_id));
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn sample_png() -> Vec<u8> {
    let base = image::RgbImage::from_fn(96, 96, |x, y| {
        image::Rgb([(x * 2) as u8, (y * 2) as u8, 64])
    });
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(base)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

fn fixture(vault_key: Option<VaultKey>) -> Fixture {
    let dirs = tempfile::tempdir().unwrap();
    let library = dirs.path().join("library");
    std::fs::create_dir_all(&library).unwrap();
    std::fs::write(library.join("sample.pdf"), sample_pdf(2)).unwrap();
    std::fs::write(library.join("chart.png"), sample_png()).unwrap();

    let directory = Arc::new(InMemoryDirectory::new());
    directory.insert(42, "alice@example.com");

    let audit = Arc::new(MemoryAuditSink::new());
    let config = EngineConfig::new(
        library.clone(),
        dirs.path().join("scratch"),
        "http://localhost:3000",
    );
    let engine = DeliveryEngine::new(
        config,
        SigningSecret::generate(),
        vault_key,
        Arc::new(MemorySessionStore::new()),
        audit.clone(),
        Arc::new(HeuristicClassifier),
        Arc::new(SilentAnnouncer),
        directory,
    )
    .unwrap();
    Fixture {
        engine,
        audit,
        library,
        _dirs: dirs,
    }
}

fn request_for(fx: &Fixture, subject_id: u64, file: Option<&str>) -> StreamRequest {
    let link = fx.engine.issue_link(subject_id, 1);
    let mut request = parse_signed_url(&link.secure_url).unwrap();
    request.file = file.map(str::to_string);
    request
}

// ─── 1. Clean delivery ──────────────────────────────────────────────────────

#[tokio::test]
async fn issue_and_redeem_yields_marked_pdf() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();

    let link = fx.engine.issue_link(42, 1);
    assert_eq!(link.bound_to, "alice@example.com");
    assert_eq!(link.expires_in, "5 minutes");

    let delivered = fx
        .engine
        .deliver(request_for(&fx, 42, None), RequestContext::unknown())
        .await
        .unwrap();
    assert_eq!(delivered.file_name, "protected-sample.pdf");

    // every page carries the recipient id
    let doc = Document::load_mem(&delivered.media).unwrap();
    let pages = doc.get_pages();
    assert_eq!(pages.len(), 2);
    for (_, page_id) in pages {
        let content = String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap()).into_owned();
        assert!(content.contains("ID: 42"));
        assert!(content.contains("User: alice@example.com"));
        assert!(content.contains("PROTECTED - 42"));
    }

    let records = fx.audit.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].violation);
    assert_eq!(records[0].threat_level, ThreatLevel::Low);
}

// ─── 2. Revocation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn revoked_session_rejects_despite_valid_capability() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();
    let request = request_for(&fx, 42, None);

    // capability alone still verifies
    let claims = CapabilityClaims {
        subject_id: 42,
        resource_id: 1,
        expires_at: request.exp.parse().unwrap(),
    };
    assert_eq!(
        fx.engine.capabilities().verify(&claims, &request.sig),
        docveil_core::CapabilityCheck::Valid
    );

    fx.engine.revoke_session(42).unwrap();
    // idempotent
    fx.engine.revoke_session(42).unwrap();

    let failure = fx
        .engine
        .deliver(request, RequestContext::unknown())
        .await
        .unwrap_err();
    assert_eq!(failure.reject_reason(), Some(RejectReason::NoSession));
    assert_eq!(failure.to_string(), "Session expired. Please login again.");

    let records = fx.audit.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].violation);
    assert_eq!(records[0].threat_level, ThreatLevel::High);
}

// ─── 3. Expiry ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_capability_is_rejected_with_audit() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();
    let mut request = request_for(&fx, 42, None);
    request.exp = "1000000".to_string(); // long past

    let failure = fx
        .engine
        .deliver(request, RequestContext::unknown())
        .await
        .unwrap_err();
    assert_eq!(failure.reject_reason(), Some(RejectReason::Expired));
    assert_eq!(failure.to_string(), "Link has expired");

    let records = fx.audit.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].violation);
}

// ─── 4. Forgery ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn forged_signature_is_rejected_with_audit() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();
    let mut request = request_for(&fx, 42, None);
    // flip one nibble of the hex signature
    let mut sig: Vec<u8> = hex::decode(&request.sig).unwrap();
    sig[10] ^= 0x40;
    request.sig = hex::encode(sig);

    let failure = fx
        .engine
        .deliver(request, RequestContext::unknown())
        .await
        .unwrap_err();
    assert_eq!(failure.reject_reason(), Some(RejectReason::InvalidSignature));

    assert!(fx.audit.records()[0].violation);
}

#[tokio::test]
async fn malformed_parameters_reject_without_audit() {
    let fx = fixture(None);
    let mut request = request_for(&fx, 42, None);
    request.uid = "not-a-number".to_string();
    let failure = fx
        .engine
        .deliver(request, RequestContext::unknown())
        .await
        .unwrap_err();
    assert_eq!(failure.reject_reason(), Some(RejectReason::MalformedRequest));
    // not a security event, no audit record
    assert!(fx.audit.records().is_empty());
}

// ─── 5. Path guard ──────────────────────────────────────────────────────────

#[tokio::test]
async fn traversal_and_bad_extension_are_bad_requests() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();

    for name in ["../../etc/passwd.pdf", "/etc/passwd.pdf", "notes.txt"] {
        let failure = fx
            .engine
            .deliver(request_for(&fx, 42, Some(name)), RequestContext::unknown())
            .await
            .unwrap_err();
        assert_eq!(
            failure.reject_reason(),
            Some(RejectReason::BadRequest),
            "{name} was not rejected as a bad request"
        );
    }
}

// ─── 6. Missing document ────────────────────────────────────────────────────

#[tokio::test]
async fn missing_document_is_not_found() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();
    let failure = fx
        .engine
        .deliver(
            request_for(&fx, 42, Some("ghost.pdf")),
            RequestContext::unknown(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.reject_reason(), Some(RejectReason::NotFound));
    assert_eq!(failure.to_string(), "File not found");
}

// ─── 7. Sealed documents ────────────────────────────────────────────────────

#[tokio::test]
async fn sealed_document_is_opened_and_marked() {
    let key = VaultKey::generate();
    let fx = fixture(Some(key.clone()));
    fx.engine.login(42).unwrap();

    // only the sealed form exists in the library
    let vault = DocumentVault::new(key);
    let blob = vault.seal(&sample_pdf(1)).unwrap();
    std::fs::write(fx.library.join("secret.pdf.enc"), blob).unwrap();

    let delivered = fx
        .engine
        .deliver(
            request_for(&fx, 42, Some("secret.pdf")),
            RequestContext::unknown(),
        )
        .await
        .unwrap();
    assert_eq!(delivered.file_name, "protected-secret.pdf");
    let doc = Document::load_mem(&delivered.media).unwrap();
    assert_eq!(doc.get_pages().len(), 1);
}

// ─── 8. Covert marking + trace ──────────────────────────────────────────────

#[tokio::test]
async fn png_delivery_is_traceable_to_the_subject() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();

    let delivered = fx
        .engine
        .deliver(
            request_for(&fx, 42, Some("chart.png")),
            RequestContext::unknown(),
        )
        .await
        .unwrap();
    assert_eq!(delivered.file_name, "protected-chart.png");

    // a "leaked" copy of the delivered bytes traces back to the subject
    let report = fx.engine.trace(delivered.media.to_vec()).await.unwrap();
    assert_eq!(
        report.watermark_found.as_deref(),
        Some("CONFIDENTIAL|User:alice@example.com|ID:42")
    );
    assert_eq!(report.user_id, Some(42));
    assert_eq!(report.leak_source, "alice@example.com");
}

// ─── 9. Clean negative trace ────────────────────────────────────────────────

#[tokio::test]
async fn unmarked_image_traces_to_unknown() {
    let fx = fixture(None);
    let report = fx.engine.trace(sample_png()).await.unwrap();
    assert_eq!(report.watermark_found, None);
    assert_eq!(report.leak_source, "Unknown");
    assert_eq!(report.user_id, None);
}

// ─── 10. Purge ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn scratch_copy_is_purged_when_delivery_drops() {
    let fx = fixture(None);
    fx.engine.login(42).unwrap();
    let delivered = fx
        .engine
        .deliver(request_for(&fx, 42, None), RequestContext::unknown())
        .await
        .unwrap();
    let scratch_path = delivered.scratch_path().to_path_buf();
    assert!(scratch_path.exists());
    drop(delivered);
    assert!(!scratch_path.exists());
}

#[tokio::test]
async fn list_documents_filters_to_the_allow_list() {
    let fx = fixture(None);
    std::fs::write(fx.library.join("notes.txt"), b"ignored").unwrap();
    let listing = fx.engine.list_documents().unwrap();
    let names: Vec<_> = listing.iter().map(|d| d.filename.as_str()).collect();
    assert_eq!(names, vec!["chart.png", "sample.pdf"]);
}
