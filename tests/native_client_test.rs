//! Native-client sink tests, driven through the `file://` driver so no cloud
//! credentials are needed. Provider and scheme validation is covered here
//! too, since it happens before any network traffic.

use std::time::Duration;

use filestage::{upload, ObjectStorageConfig, S3Config, S3Credentials, UploadError, UploadOpts};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONTENT: &[u8] = b"123456789";

fn reader() -> std::io::Cursor<Vec<u8>> {
    std::io::Cursor::new(CONTENT.to_vec())
}

fn file_opts(root: &std::path::Path) -> UploadOpts {
    UploadOpts {
        use_native_client: true,
        remote_temp_object_id: "tmp/upload-1".into(),
        storage_config: ObjectStorageConfig {
            provider: "Generic".into(),
            url: format!("file://{}", root.display()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn file_driver_stages_the_object() {
    let dir = tempfile::tempdir().unwrap();
    let handle = upload(
        CancellationToken::new(),
        reader(),
        CONTENT.len() as i64,
        "file",
        file_opts(dir.path()),
    )
    .await
    .unwrap();

    assert_eq!(handle.size, 9);
    let staged = dir.path().join("tmp/upload-1");
    assert_eq!(std::fs::read(&staged).unwrap(), CONTENT);
}

#[tokio::test]
async fn staged_object_is_removed_when_the_scope_ends() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();
    upload(
        ctx.clone(),
        reader(),
        CONTENT.len() as i64,
        "file",
        file_opts(dir.path()),
    )
    .await
    .unwrap();

    let staged = dir.path().join("tmp/upload-1");
    assert!(staged.exists());

    ctx.cancel();
    for _ in 0..200 {
        if !staged.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("staged object was not removed after the scope ended");
}

#[tokio::test]
async fn size_mismatch_leaves_no_staged_object() {
    let dir = tempfile::tempdir().unwrap();
    let err = upload(
        CancellationToken::new(),
        reader(),
        CONTENT.len() as i64 + 1,
        "file",
        file_opts(dir.path()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UploadError::SizeMismatch { .. }));

    let staged = dir.path().join("tmp/upload-1");
    for _ in 0..200 {
        if !staged.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("aborted object must not be committed");
}

#[tokio::test]
async fn cancelled_s3_upload_aborts_the_multipart_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/xml")
                .set_body_string(
                    "<InitiateMultipartUploadResult>\
                     <Bucket>uploads-bucket</Bucket>\
                     <Key>tmp/upload-1</Key>\
                     <UploadId>uid-1</UploadId>\
                     </InitiateMultipartUploadResult>",
                ),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let opts = UploadOpts {
        use_native_client: true,
        remote_temp_object_id: "tmp/upload-1".into(),
        storage_config: ObjectStorageConfig {
            provider: "AWS".into(),
            s3_credentials: S3Credentials {
                aws_access_key_id: "key".into(),
                aws_secret_access_key: "secret".into(),
                aws_session_token: None,
            },
            s3_config: S3Config {
                bucket: "uploads-bucket".into(),
                region: "us-east-1".into(),
                endpoint: Some(server.uri()),
                path_style: true,
            },
            ..Default::default()
        },
        ..Default::default()
    };

    // A reader that never finishes keeps the multipart session open.
    let (mut writer, body) = tokio::io::duplex(64);
    tokio::io::AsyncWriteExt::write_all(&mut writer, b"stalled")
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let task = tokio::spawn(upload(ctx.clone(), body, -1, "file", opts));
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, UploadError::Cancelled));

    // Cleanup must still reach the session opened before the cancellation.
    for _ in 0..200 {
        let requests = server.received_requests().await.unwrap();
        if requests.iter().any(|r| {
            r.method.as_str() == "DELETE" && r.url.query().unwrap_or("").contains("uploadId=uid-1")
        }) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("multipart session opened before cancellation was not aborted");
}

#[tokio::test]
async fn cancelled_file_driver_upload_leaves_no_staged_files() {
    fn files_under(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| {
                        let path = entry.path();
                        if path.is_dir() {
                            files_under(&path)
                        } else {
                            1
                        }
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    let dir = tempfile::tempdir().unwrap();
    let opts = file_opts(dir.path());

    let (mut writer, body) = tokio::io::duplex(64);
    tokio::io::AsyncWriteExt::write_all(&mut writer, b"stalled")
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let task = tokio::spawn(upload(ctx.clone(), body, -1, "file", opts));
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, UploadError::Cancelled));

    // The driver stages into a scratch file; aborting must remove it.
    for _ in 0..200 {
        if files_under(dir.path()) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cancelled upload left staged files behind");
}

#[tokio::test]
async fn unknown_provider_without_url_is_rejected() {
    let opts = UploadOpts {
        use_native_client: true,
        remote_temp_object_id: "tmp/upload-1".into(),
        storage_config: ObjectStorageConfig {
            provider: "SomeCloud".into(),
            ..Default::default()
        },
        ..Default::default()
    };

    let err = upload(
        CancellationToken::new(),
        reader(),
        CONTENT.len() as i64,
        "file",
        opts,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UploadError::Config(_)));
}

#[tokio::test]
async fn unknown_scheme_is_rejected() {
    let mut opts = file_opts(std::path::Path::new("/tmp"));
    opts.storage_config.url = "carrier-pigeon://coop".into();

    let err = upload(
        CancellationToken::new(),
        reader(),
        CONTENT.len() as i64,
        "file",
        opts,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UploadError::Config(_)));
}

#[tokio::test]
async fn missing_object_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = file_opts(dir.path());
    opts.remote_temp_object_id = String::new();

    let err = upload(
        CancellationToken::new(),
        reader(),
        CONTENT.len() as i64,
        "file",
        opts,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, UploadError::Config(_)));
}
