use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use burn_core::{Packaging, Payload, Verification};
use burn_security::{CertificateInfo, PayloadVerifier, TrustProvider, VerificationError};
use sha1::{Digest, Sha1};

use crate::{
    acquire_from_source, extract_container, is_verification_failure, CacheLayout, Downloader,
    HttpDownloader, PackageCache, RetryPolicy,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "burn-cache-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

struct NoTrust;

impl TrustProvider for NoTrust {
    fn authenticode_chain(&self, path: &Path) -> Result<Vec<CertificateInfo>, VerificationError> {
        Err(VerificationError::Unsigned {
            path: path.to_path_buf(),
            reason: "no signatures in tests".to_string(),
        })
    }

    fn verify_catalog_member(&self, _catalog: &Path, path: &Path) -> Result<(), VerificationError> {
        Err(VerificationError::Unverifiable {
            path: path.to_path_buf(),
        })
    }
}

fn test_cache(root: &Path) -> PackageCache {
    let layout = CacheLayout::new(root.join("machine"), root.join("user"), root.join("work"));
    PackageCache::new(layout, PayloadVerifier::new(Arc::new(NoTrust))).with_retry(RetryPolicy::none())
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

fn payload(key: &str, file_path: &str, content: &[u8]) -> Payload {
    Payload {
        key: key.to_string(),
        file_path: file_path.to_string(),
        size: content.len() as u64,
        verification: Verification {
            hash: Some(sha1_hex(content)),
            ..Verification::default()
        },
        packaging: Packaging::External,
        container: None,
        source_path: None,
        download_url: None,
        cached: false,
    }
}

#[test]
fn complete_payload_moves_verified_file_into_cache() {
    let root = test_root();
    let cache = test_cache(&root);
    let content = b"msi bytes";
    let payload = payload("p1", "sub/setup.msi", content);
    let unverified = cache.layout().unverified_payload_path("p1", None);
    fs::create_dir_all(unverified.parent().expect("parent")).expect("must create work dir");
    fs::write(&unverified, content).expect("must write payload");

    let cached = cache
        .complete_payload(false, "pkg-v1", &payload, &unverified, true)
        .expect("verified payload is cached");

    assert_eq!(
        cached,
        root.join("user")
            .join("Package Cache")
            .join("pkg-v1")
            .join("sub")
            .join("setup.msi")
    );
    assert_eq!(fs::read(&cached).expect("cached file reads"), content);
    assert!(!unverified.exists(), "move removes the working copy");
    assert!(cache.is_payload_cached(false, "pkg-v1", &payload));
}

#[test]
fn complete_payload_copy_keeps_working_file_for_other_consumers() {
    let root = test_root();
    let cache = test_cache(&root);
    let content = b"shared";
    let payload = payload("shared", "shared.cab", content);
    let unverified = root.join("work").join("shared");
    fs::create_dir_all(unverified.parent().expect("parent")).expect("must create work dir");
    fs::write(&unverified, content).expect("must write payload");

    cache
        .complete_payload(true, "a", &payload, &unverified, false)
        .expect("first consumer copies");
    cache
        .complete_payload(true, "b", &payload, &unverified, false)
        .expect("second consumer copies");
    assert!(unverified.exists());
    assert!(cache.is_payload_cached(true, "a", &payload));
    assert!(cache.is_payload_cached(true, "b", &payload));
}

#[test]
fn hash_mismatch_commits_nothing() {
    let root = test_root();
    let cache = test_cache(&root);
    let payload = payload("p", "file.exe", b"expected");
    let unverified = root.join("work").join("p");
    fs::create_dir_all(unverified.parent().expect("parent")).expect("must create work dir");
    fs::write(&unverified, b"tampered").expect("must write payload");

    let err = cache
        .complete_payload(false, "pkg", &payload, &unverified, true)
        .expect_err("tampered payload must fail");
    assert!(is_verification_failure(&err));
    assert!(!cache
        .layout()
        .completed_payload_path(false, "pkg", "file.exe")
        .expect("path")
        .exists());
    assert!(unverified.exists());
}

#[test]
fn certificate_failure_does_not_fall_back_to_a_matching_hash() {
    let root = test_root();
    let cache = test_cache(&root);
    let content = b"signed?";
    let mut payload = payload("p", "signed.exe", content);
    payload.verification.certificate_public_key_id = Some("00ff".to_string());
    let unverified = root.join("work").join("signed");
    fs::create_dir_all(unverified.parent().expect("parent")).expect("must create work dir");
    fs::write(&unverified, content).expect("must write payload");

    let err = cache
        .complete_payload(false, "pkg", &payload, &unverified, false)
        .expect_err("certificate failure is fatal");
    assert!(is_verification_failure(&err));
}

#[test]
fn extract_container_writes_requested_entries_only() {
    let root = test_root();
    let container = root.join("c.tar");
    {
        let file = fs::File::create(&container).expect("must create tar");
        let mut builder = tar::Builder::new(file);
        for (name, data) in [("a.msi", b"aaa".as_slice()), ("dir/b.cab", b"bb".as_slice()), ("c.txt", b"c".as_slice())] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data)
                .expect("must append entry");
        }
        builder.finish().expect("must finish tar");
    }

    let out_a = root.join("out").join("a");
    let out_b = root.join("out").join("b");
    extract_container(
        &container,
        &[
            ("a.msi".to_string(), out_a.clone()),
            ("dir\\b.cab".to_string(), out_b.clone()),
        ],
    )
    .expect("extraction succeeds");
    assert_eq!(fs::read(&out_a).expect("a extracted"), b"aaa");
    assert_eq!(fs::read(&out_b).expect("b extracted"), b"bb");
    assert!(!root.join("out").join("c.txt").exists());

    let err = extract_container(&container, &[("missing.msi".to_string(), root.join("x"))])
        .expect_err("missing entry fails");
    assert!(err.to_string().contains("missing.msi"));
}

#[test]
fn acquire_from_source_copies_and_reports_missing_sources() {
    let root = test_root();
    let source = root.join("bundle").join("external.msu");
    fs::create_dir_all(source.parent().expect("parent")).expect("must create bundle dir");
    fs::write(&source, b"msu").expect("must write source");

    let destination = root.join("work").join("external");
    let copied = acquire_from_source(&source, &destination).expect("copy succeeds");
    assert_eq!(copied, 3);
    assert!(source.exists());

    let err = acquire_from_source(&root.join("nope"), &destination).expect_err("missing source");
    assert!(err.to_string().contains("payload source not found"));
}

#[test]
fn http_downloader_streams_body_and_reports_progress() {
    let body = b"downloaded payload".to_vec();
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind test server");
    let address = listener.local_addr().expect("must read test server address");
    let served = body.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept client");
        let mut request = [0_u8; 1024];
        let _ = stream.read(&mut request).expect("must read request");
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            served.len()
        )
        .expect("must write headers");
        stream.write_all(&served).expect("must write body");
        stream.flush().expect("must flush response");
    });

    let root = test_root();
    let destination = root.join("work").join("download.bin");
    let mut last = (0, None);
    HttpDownloader::new()
        .expect("client builds")
        .download(
            &format!("http://{address}/payload"),
            &destination,
            &mut |done, total| last = (done, total),
        )
        .expect("download succeeds");
    server.join().expect("server thread joins");

    assert_eq!(fs::read(&destination).expect("download written"), body);
    assert_eq!(last, (body.len() as u64, Some(body.len() as u64)));
}

#[test]
fn layout_places_payloads_and_bundle_under_directory() {
    let root = test_root();
    let cache = test_cache(&root);
    let content = b"layout me";
    let payload = payload("p", "packages/a.msi", content);
    let unverified = root.join("work").join("lp");
    fs::create_dir_all(unverified.parent().expect("parent")).expect("must create work dir");
    fs::write(&unverified, content).expect("must write payload");
    let executable = root.join("setup-bundle");
    fs::write(&executable, b"exe").expect("must write bundle");

    let layout_dir = root.join("layout");
    let placed = cache
        .layout_payload(&layout_dir, &payload, &unverified, true)
        .expect("payload laid out");
    let bundle = cache
        .layout_bundle(&layout_dir, &executable, "setup.exe")
        .expect("bundle laid out");

    assert_eq!(placed, layout_dir.join("packages").join("a.msi"));
    assert_eq!(bundle, layout_dir.join("setup.exe"));
    assert!(executable.exists());
}

#[test]
fn cache_bundle_copies_executable_into_bundle_cache_dir() {
    let root = test_root();
    let cache = test_cache(&root);
    let executable = root.join("running.exe");
    fs::write(&executable, b"bundle").expect("must write bundle");

    let cached = cache
        .cache_bundle(true, "{bundle-id}", &executable, "setup.exe")
        .expect("bundle cached");
    assert_eq!(
        cached,
        root.join("machine")
            .join("Package Cache")
            .join("{bundle-id}")
            .join("setup.exe")
    );
    cache.remove_bundle(true, "{bundle-id}").expect("bundle removed");
    assert!(!cached.exists());
}

#[test]
fn remove_package_deletes_directory_and_ignores_missing() {
    let root = test_root();
    let cache = test_cache(&root);
    let dir = cache.layout().completed_path(false, "pkg");
    fs::create_dir_all(dir.join("nested")).expect("must create cache dir");
    fs::write(dir.join("nested").join("f"), b"x").expect("must write file");

    cache.remove_package(false, "pkg").expect("removal succeeds");
    assert!(!dir.exists());
    cache.remove_package(false, "pkg").expect("second removal is a no-op");
}

#[test]
fn pending_removals_are_retried_and_pruned() {
    let root = test_root();
    let cache = test_cache(&root);
    let gone = root.join("stale-dir");
    fs::create_dir_all(&gone).expect("must create stale dir");
    let stuck = root.join("not-a-dir");
    fs::write(&stuck, b"file").expect("must write blocker");

    let list = cache.layout().pending_removals_path(false);
    fs::create_dir_all(list.parent().expect("parent")).expect("must create cache root");
    fs::write(&list, format!("{}\n{}\n", gone.display(), stuck.display()))
        .expect("must write pending list");

    let remaining = cache
        .process_pending_removals(false)
        .expect("pending removals processed");
    assert_eq!(remaining, 1);
    assert!(!gone.exists());
    let left = fs::read_to_string(&list).expect("list kept");
    assert_eq!(left.trim(), stuck.display().to_string());

    fs::remove_file(&stuck).expect("must remove blocker");
    assert_eq!(cache.process_pending_removals(false).expect("processed"), 0);
    assert!(!list.exists());
    assert_eq!(cache.process_pending_removals(false).expect("no list"), 0);
}

#[test]
fn machine_root_secured_flag_can_be_reset() {
    let root = test_root();
    let cache = test_cache(&root);
    let first = cache.ensure_cache_root(true).expect("root created");
    let second = cache.ensure_cache_root(true).expect("root reused");
    assert_eq!(first, second);
    cache.reset_root_secured();
    cache.ensure_cache_root(true).expect("root secured again");
}
