//! HTTP surface: uploads, projects, navigation patch, operational endpoints


use harness::{TestClient, start_server};
use easel_protocol::ServerMessage;
use serde_json::{Value, json};

fn api(server: &easel_daemon::server::ServerHandle) -> String {
    format!("http://{}", server.http_addr)
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(200, 100, image::Rgb([40, 80, 120]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
async fn health_reports_ok() {
    let (server, _dir) = start_server(256).await;
    let body: Value = reqwest::get(format!("{}/health", api(&server)))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["features"].as_array().unwrap().len() >= 3);
}

#[tokio::test]
async fn project_crud_roundtrip() {
    let (server, _dir) = start_server(256).await;
    let client = reqwest::Client::new();
    let base = api(&server);

    let created: Value = client
        .post(format!("{base}/projects"))
        .json(&json!({"name": "mural", "username": "alice"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["name"], "mural");

    let listed: Value = client
        .get(format!("{base}/projects"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().iter().any(|p| p["id"] == id));

    let updated: Value = client
        .put(format!("{base}/projects/{id}"))
        .json(&json!({"description": "wall art"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["description"], "wall art");

    let status = client
        .delete(format!("{base}/projects/{id}"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);

    let status = client
        .get(format!("{base}/projects/{id}"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn navigation_patch_is_validated() {
    let (server, _dir) = start_server(256).await;
    let client = reqwest::Client::new();
    let base = api(&server);

    let created: Value = client
        .post(format!("{base}/projects"))
        .json(&json!({"name": "nav", "username": "alice"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    // Out-of-range scale is refused.
    let status = client
        .patch(format!("{base}/projects/{id}/canvas"))
        .json(&json!({"scale": 11.0}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);

    let status = client
        .patch(format!("{base}/projects/{id}/canvas"))
        .json(&json!({"scale": 1.5, "offset": [10.0, -4.0], "timestamp": 1722500000000i64}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);

    let canvas: Value = client
        .get(format!("{base}/projects/{id}/canvas"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(canvas["canvas"]["navigation"]["scale"], json!(1.5));
}

#[tokio::test]
async fn upload_dedupes_and_serves_blob_and_thumbnails() {
    let (server, _dir) = start_server(256).await;
    let client = reqwest::Client::new();
    let base = api(&server);
    let bytes = png_bytes();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(bytes.clone())
            .file_name("photo.png")
            .mime_str("image/png")
            .unwrap(),
    );
    let first: Value = client
        .post(format!("{base}/uploads"))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hash = first["hash"].as_str().unwrap().to_string();
    let url = first["url"].as_str().unwrap().to_string();
    assert_eq!(first["size"].as_u64().unwrap(), bytes.len() as u64);
    assert_eq!(first["thumbnails"], json!([64, 128]));

    // Identical content resolves to the same artifact.
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(bytes.clone())
            .file_name("copy.png")
            .mime_str("image/png")
            .unwrap(),
    );
    let second: Value = client
        .post(format!("{base}/uploads"))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["hash"].as_str().unwrap(), hash);

    let served = client
        .get(format!("{base}{url}"))
        .send()
        .await
        .unwrap();
    assert_eq!(served.status(), reqwest::StatusCode::OK);
    assert_eq!(served.bytes().await.unwrap().len(), bytes.len());

    let thumb = client
        .get(format!("{base}/thumbnails/64/{hash}.jpg"))
        .send()
        .await
        .unwrap();
    assert_eq!(thumb.status(), reqwest::StatusCode::OK);
    assert_eq!(
        thumb.headers()["content-type"].to_str().unwrap(),
        "image/jpeg"
    );

    let missing = client
        .get(format!("{base}/thumbnails/2048/{hash}.jpg"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_with_project_notifies_the_room() {
    let (server, _dir) = start_server(256).await;
    let mut member = TestClient::connect(server.ws_addr).await.unwrap();
    member.join(40, "alice", "A").await.unwrap();

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(png_bytes())
                .file_name("shared.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .text("projectId", "40");
    reqwest::Client::new()
        .post(format!("{}/uploads", api(&server)))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let ready = member
        .recv_until(|m| matches!(m, ServerMessage::MediaReady { .. }))
        .await
        .unwrap();
    let ServerMessage::MediaReady { urls, formats, .. } = ready else {
        unreachable!()
    };
    assert!(urls.contains_key("original"));
    assert_eq!(formats, vec!["image/png".to_string()]);
}

#[tokio::test]
async fn database_endpoints_report_and_clean() {
    let (server, _dir) = start_server(256).await;
    let client = reqwest::Client::new();
    let base = api(&server);

    let size: Value = client
        .get(format!("{base}/database/size"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(size["sizeBytes"].as_u64().unwrap() > 0);

    // An unreferenced upload is orphaned and swept.
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"orphan bytes".to_vec())
            .file_name("orphan.bin")
            .mime_str("application/octet-stream")
            .unwrap(),
    );
    client
        .post(format!("{base}/uploads"))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let report: Value = client
        .post(format!("{base}/database/cleanup"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["filesRemoved"].as_u64().unwrap(), 1);
}
