mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use stevedore_gateway::{serve_connection, Call, FaultKind, Reply};
use stevedore_image::layout::tar_gz_dir;
use stevedore_image::ImageReference;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use common::{write_layout, FakeRegistry, Harness};

fn build_params(h: &Harness, format: &str, tags: &[&str]) -> Value {
    let dockerfile = h.tmp.path().join("ctx").join("Dockerfile");
    std::fs::create_dir_all(dockerfile.parent().unwrap()).unwrap();
    std::fs::write(&dockerfile, "FROM scratch\nCOPY app /app\nLABEL built=yes\n").unwrap();
    json!({
        "build": {
            "dockerfiles": [dockerfile.to_string_lossy()],
            "output_format": format,
            "tags": tags,
        }
    })
}

fn concat_logs(replies: &[Reply]) -> String {
    replies
        .iter()
        .flat_map(|r| r.parameters["logs"].as_array().cloned().unwrap_or_default())
        .map(|l| l.as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_remove_in_use_then_forced() {
    let h = Harness::new();
    let image = h.seed("app", &["myapp:latest"]).await;
    h.runtime.add("web", &image.id);
    let before = h.listed_ids().await;

    let fault = h
        .call("RemoveImage", json!({ "name": "myapp:latest", "force": false }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::InUse);
    assert_eq!(h.listed_ids().await, before);

    let removed = h
        .call("RemoveImage", json!({ "name": "myapp:latest", "force": true }))
        .await
        .unwrap();
    assert_eq!(removed["image"], image.id.as_str());

    let fault = h
        .call("GetImage", json!({ "name": "myapp:latest" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::NotFound);
}

#[tokio::test]
async fn test_prune_removes_only_unused_images() {
    let h = Harness::new();
    let used = h.seed("used", &["used:1"]).await;
    let idle = h.seed("idle", &["idle:1"]).await;
    let untagged = h.seed("untagged", &[]).await;
    h.runtime.add("db", &used.id);

    let pruned = h.call("ImagesPrune", json!({})).await.unwrap();
    let mut pruned: Vec<String> = serde_json::from_value(pruned["pruned"].clone()).unwrap();
    pruned.sort();
    let mut expected = vec![idle.id, untagged.id];
    expected.sort();
    assert_eq!(pruned, expected);
    assert_eq!(h.listed_ids().await, vec![used.id]);
}

#[tokio::test]
async fn test_tag_is_idempotent_and_resolvable() {
    let h = Harness::new();
    let image = h.seed("web", &[]).await;

    for _ in 0..2 {
        let tagged = h
            .call("TagImage", json!({ "name": image.id, "tagged": "web:2" }))
            .await
            .unwrap();
        assert_eq!(tagged["image"], image.id.as_str());
    }

    let got = h.call("GetImage", json!({ "name": "web:2" })).await.unwrap();
    assert_eq!(got["image"]["id"], image.id.as_str());
    let tags = got["image"]["repo_tags"].as_array().unwrap();
    assert_eq!(tags.len(), 1);

    let exists = h.call("ImageExists", json!({ "name": "web:2" })).await.unwrap();
    assert_eq!(exists["exists"], true);
    let exists = h.call("ImageExists", json!({ "name": "web:3" })).await.unwrap();
    assert_eq!(exists["exists"], false);
}

#[tokio::test]
async fn test_remove_drops_every_tag_and_untag_keeps_entry() {
    let h = Harness::new();
    let image = h.seed("multi", &["multi:1", "multi:2", "multi:3"]).await;

    let untagged = h
        .call("UntagImage", json!({ "name": "multi:1", "tag": "multi:3" }))
        .await
        .unwrap();
    assert_eq!(untagged["image"], image.id.as_str());
    assert!(h.call("GetImage", json!({ "name": "multi:3" })).await.is_err());
    assert!(h.call("GetImage", json!({ "name": "multi:2" })).await.is_ok());

    h.call("RemoveImage", json!({ "name": "multi:2" }))
        .await
        .unwrap();
    for name in ["multi:1", "multi:2"] {
        let fault = h.call("GetImage", json!({ "name": name })).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::NotFound);
    }
    assert!(h.listed_ids().await.is_empty());
}

#[tokio::test]
async fn test_invalid_build_format_sends_one_fault() {
    let h = Harness::new();
    let call = Call::new("BuildImage", build_params(&h, "tarball", &["app:1"])).streaming();
    let replies = h.replies(call).await;

    assert_eq!(replies.len(), 1);
    let fault = replies[0].clone().into_result().unwrap_err();
    assert_eq!(fault.kind, FaultKind::InvalidArgument);
    assert!(h.listed_ids().await.is_empty());
}

#[tokio::test]
async fn test_streamed_build_logs_equal_single_reply_logs() {
    let h = Harness::new();

    let streamed = h
        .replies(Call::new("BuildImage", build_params(&h, "oci", &["app:1"])).streaming())
        .await;
    let (last, partials) = streamed.split_last().unwrap();
    assert!(!partials.is_empty(), "streamed build sent no partial replies");
    assert!(partials.iter().all(|r| r.continues && r.error.is_none()));
    assert!(partials.iter().all(|r| r.parameters.get("id").is_none()));
    assert!(!concat_logs(partials).is_empty());
    assert!(!last.continues);
    let streamed_id = last.parameters["id"].as_str().unwrap().to_string();

    let single = h
        .replies(Call::new("BuildImage", build_params(&h, "oci", &["app:1"])))
        .await;
    assert_eq!(single.len(), 1);
    assert!(!single[0].continues);
    let single_id = single[0].parameters["id"].as_str().unwrap();

    assert_eq!(concat_logs(&streamed), concat_logs(&single));
    assert_eq!(
        concat_logs(&single),
        "STEP 1/3: FROM scratch\nSTEP 2/3: COPY app /app\ncopying 1 file\nSTEP 3/3: LABEL built=yes\nCOMMIT\n"
    );
    assert_eq!(streamed_id, single_id);
    let got = h.call("GetImage", json!({ "name": "app:1" })).await.unwrap();
    assert_eq!(got["image"]["id"], single_id);
}

#[tokio::test]
async fn test_failed_build_ends_with_fault() {
    let h = Harness::new();
    let mut params = build_params(&h, "", &["app:1"]);
    params["build"]["build_args"] = json!({ "FAIL": "1" });

    let replies = h
        .replies(Call::new("BuildImage", params).streaming())
        .await;
    let (last, partials) = replies.split_last().unwrap();
    assert!(!partials.is_empty());
    assert!(partials.iter().all(|r| r.continues && r.error.is_none()));
    assert_eq!(
        concat_logs(partials),
        "STEP 1/3: FROM scratch\nSTEP 2/3: COPY app /app\ncopying 1 file\nSTEP 3/3: LABEL built=yes\n"
    );
    assert!(!last.continues);
    assert_eq!(last.error.as_deref(), Some("InvalidArgument"));
    assert!(h.listed_ids().await.is_empty());
}

#[tokio::test]
async fn test_search_skips_failing_registry_when_several() {
    let h = Harness::with_registries(&["good.io", "down.io", "other.io"]);
    {
        let mut hits = h.registry.search_hits.lock();
        hits.insert("good.io".to_string(), Some(vec![FakeRegistry::hit("good.io/nginx")]));
        hits.insert("down.io".to_string(), None);
        hits.insert("other.io".to_string(), Some(vec![FakeRegistry::hit("other.io/nginx")]));
    }

    let found = h
        .call("SearchImage", json!({ "name": "nginx", "limit": 10 }))
        .await
        .unwrap();
    let names: Vec<&str> = found["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["good.io/nginx", "other.io/nginx"]);
}

#[tokio::test]
async fn test_search_single_registry_failure_is_returned() {
    let h = Harness::with_registries(&["down.io"]);
    let fault = h
        .call("SearchImage", json!({ "name": "nginx" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::NetworkError);
}

#[tokio::test]
async fn test_import_records_message_as_only_history_comment() {
    let h = Harness::new();
    let rootfs = h.tmp.path().join("rootfs");
    std::fs::create_dir_all(rootfs.join("etc")).unwrap();
    std::fs::write(rootfs.join("etc/os-release"), "ID=test\n").unwrap();
    let tarball = h.tmp.path().join("rootfs.tar.gz");
    tar_gz_dir(&rootfs, &tarball).unwrap();

    let imported = h
        .call(
            "ImportImage",
            json!({
                "source": tarball.to_string_lossy(),
                "reference": "imported:1",
                "message": "initial import",
                "changes": ["CMD [\"/bin/sh\"]"],
            }),
        )
        .await
        .unwrap();

    let history = h
        .call("HistoryImage", json!({ "name": "imported:1" }))
        .await
        .unwrap();
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["comment"], "initial import");

    let inspected = h
        .call("InspectImage", json!({ "name": imported["image"] }))
        .await
        .unwrap();
    let inspected: Value = serde_json::from_str(inspected["image"].as_str().unwrap()).unwrap();
    assert_eq!(inspected["config"]["config"]["Cmd"], json!(["/bin/sh"]));
}

#[tokio::test]
async fn test_archive_pull_makes_no_network_call() {
    let h = Harness::new();
    let image = h.seed("saved", &["saved:1"]).await;
    let archive = h.tmp.path().join("saved.tar");
    let destination = format!("docker-archive:{}", archive.display());

    h.call("ExportImage", json!({ "name": "saved:1", "destination": destination }))
        .await
        .unwrap();
    assert!(archive.is_file());
    h.call("RemoveImage", json!({ "name": "saved:1" })).await.unwrap();

    let pulled = h
        .call("PullImage", json!({ "name": destination }))
        .await
        .unwrap();
    assert_eq!(pulled["id"], image.id.as_str());
    assert!(h.registry.pulls.lock().is_empty());
}

#[tokio::test]
async fn test_pull_with_archive_prefix() {
    let h = Harness::new();
    let image = h.seed("saved", &["saved:1"]).await;
    let archive = h.tmp.path().join("x.tar");

    h.call(
        "ExportImage",
        json!({ "name": "saved:1", "destination": format!("docker-archive:{}", archive.display()) }),
    )
    .await
    .unwrap();
    h.call("RemoveImage", json!({ "name": "saved:1" })).await.unwrap();
    assert!(h.listed_ids().await.is_empty());

    let pulled = h
        .call("PullImage", json!({ "name": format!("archive:{}", archive.display()) }))
        .await
        .unwrap();
    assert_eq!(pulled["id"], image.id.as_str());
    assert!(h.registry.pulls.lock().is_empty());
    assert_eq!(h.listed_ids().await, vec![image.id.clone()]);
}

#[tokio::test]
async fn test_build_rejects_unenforceable_options() {
    let h = Harness::new();
    for extra in [
        json!({ "network": "bridge" }),
        json!({ "resources": { "volumes": ["/data:/data"] } }),
        json!({ "resources": { "add_hosts": ["db:10.0.0.2"] } }),
    ] {
        let mut params = build_params(&h, "oci", &["app:1"]);
        for (key, value) in extra.as_object().unwrap() {
            params["build"][key] = value.clone();
        }
        let replies = h.replies(Call::new("BuildImage", params).streaming()).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error.as_deref(), Some("NotImplemented"));
    }
    assert!(h.listed_ids().await.is_empty());
}

#[tokio::test]
async fn test_registry_pull_uses_client() {
    let h = Harness::new();
    let remote = write_layout(&h.tmp.path().join("remote"), "remote");
    let reference = ImageReference::parse("busybox").unwrap().full_reference();
    h.registry
        .layouts
        .lock()
        .insert(reference.clone(), remote.root().to_path_buf());

    let pulled = h.call("PullImage", json!({ "name": "busybox" })).await.unwrap();
    assert_eq!(h.registry.pulls.lock().as_slice(), &[reference]);
    let got = h.call("GetImage", json!({ "name": "busybox" })).await.unwrap();
    assert_eq!(got["image"]["id"], pulled["id"]);
}

#[tokio::test]
async fn test_push_format_tokens() {
    let h = Harness::new();
    h.seed("push", &["quay.io/team/push:1"]).await;

    let fault = h
        .call("PushImage", json!({ "name": "quay.io/team/push:1", "format": "v2s1" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::NotImplemented);

    let fault = h
        .call("PushImage", json!({ "name": "quay.io/team/push:1", "format": "v3" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::InvalidArgument);

    h.call("PushImage", json!({ "name": "quay.io/team/push:1", "format": "v2s2" }))
        .await
        .unwrap();
    assert_eq!(h.registry.pushes.lock().len(), 1);
}

#[tokio::test]
async fn test_commit_resumes_container_when_capture_fails() {
    let h = Harness::new();
    let base = h.seed("base", &["base:1"]).await;
    h.runtime.add("web", &base.id);

    let fault = h
        .call("Commit", json!({ "name": "web", "image_name": "snap:1", "pause": true }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::StoreUnavailable);
    assert_eq!(h.runtime.status("web"), "running");
    assert_eq!(
        h.runtime.calls.lock().as_slice(),
        &["pause web", "export web", "unpause web"]
    );
    assert_eq!(h.listed_ids().await, vec![base.id]);
}

#[tokio::test]
async fn test_commit_adds_layer_on_base() {
    let h = Harness::new();
    let base = h.seed("base", &["base:1"]).await;
    h.runtime.add("web", &base.id);
    let diff = h.tmp.path().join("diff");
    std::fs::create_dir_all(&diff).unwrap();
    std::fs::write(diff.join("state.db"), "rows").unwrap();
    *h.runtime.diff_source.lock() = Some(diff);

    let committed = h
        .call(
            "Commit",
            json!({
                "name": "web",
                "image_name": "snap:1",
                "author": "ops",
                "message": "nightly snapshot",
                "changes": ["ENV MODE=snapshot"],
            }),
        )
        .await
        .unwrap();

    let got = h.call("GetImage", json!({ "name": "snap:1" })).await.unwrap();
    assert_eq!(got["image"]["id"], committed["image"]);
    assert_eq!(got["image"]["parent_id"], base.id.as_str());

    let history = h
        .call("HistoryImage", json!({ "name": "snap:1" }))
        .await
        .unwrap();
    let entries = history["history"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["comment"], "nightly snapshot");
}

#[tokio::test]
async fn test_commit_rejects_unknown_format_first() {
    let h = Harness::new();
    let fault = h
        .call("Commit", json!({ "name": "missing", "manifest_type": "tarball" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::InvalidArgument);
    assert!(h.runtime.calls.lock().is_empty());
}

#[tokio::test]
async fn test_unimplemented_and_malformed_calls() {
    let h = Harness::new();
    let fault = h.call("CreateImage", json!({})).await.unwrap_err();
    assert_eq!(fault.kind, FaultKind::NotImplemented);
    let fault = h.call("FrobnicateImage", json!({})).await.unwrap_err();
    assert_eq!(fault.kind, FaultKind::NotImplemented);
    let fault = h
        .call("RemoveImage", json!({ "name": "x", "force": "yes" }))
        .await
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::InvalidArgument);
}

#[tokio::test]
async fn test_socket_framing_streams_build_then_next_call() {
    let h = Harness::new();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let service = Arc::clone(&h.service);
    let served = tokio::spawn(async move { serve_connection(service, server).await });

    let (read, mut write) = tokio::io::split(client);
    let mut lines = BufReader::new(read).lines();

    let build = Call::new("BuildImage", build_params(&h, "docker", &["sock:1"])).streaming();
    let mut out = serde_json::to_vec(&build).unwrap();
    out.extend_from_slice(b"\nnot json\n");
    out.extend_from_slice(&serde_json::to_vec(&Call::new("ListImages", Value::Null)).unwrap());
    out.push(b'\n');
    write.write_all(&out).await.unwrap();

    let mut build_replies = Vec::new();
    loop {
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: Reply = serde_json::from_str(&line).unwrap();
        let done = !reply.continues;
        build_replies.push(reply);
        if done {
            break;
        }
    }
    assert!(build_replies.last().unwrap().parameters["id"].is_string());

    let malformed: Reply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(malformed.error.as_deref(), Some("InvalidArgument"));

    let listed: Reply = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(listed.parameters["images"].as_array().unwrap().len(), 1);

    drop(write);
    drop(lines);
    served.await.unwrap().unwrap();
}
