//! End-to-end pipeline tests
//!
//! Exercise the full stack the way the HTTP tier would: account creation
//! through the creator, writes through the transactor, events off the
//! sequencer, blobs through the disk store.
use std::sync::Arc;

use tidehollow_pds::account::creation::CreateAccountInput;
use tidehollow_pds::actor_store::models::ListRecordsParams;
use tidehollow_pds::actor_store::prepare::{prepare_create, prepare_delete};
use tidehollow_pds::blob_store::blob_cid;
use tidehollow_pds::context::AppContext;
use tidehollow_pds::error::PdsError;
use tidehollow_pds::jobs;
use tidehollow_pds::repo::dag;
use tidehollow_pds::sequencer::SeqEvent;
use tidehollow_pds::ServerConfig;

struct TestServer {
    _dir: tempfile::TempDir,
    ctx: AppContext,
}

fn test_config(root: &std::path::Path, invite_required: bool) -> ServerConfig {
    use tidehollow_pds::config::*;
    ServerConfig {
        service: ServiceConfig {
            hostname: "localhost".to_string(),
            port: 2583,
            service_did: "did:web:localhost".to_string(),
            version: "0.0.0-test".to_string(),
            blob_upload_limit: 5 * 1024 * 1024,
            dev_mode: true,
        },
        storage: StorageConfig {
            data_directory: root.to_path_buf(),
            account_db: root.join("account.sqlite"),
            sequencer_db: root.join("sequencer.sqlite"),
            did_cache_db: root.join("did_cache.sqlite"),
            actor_store_directory: root.join("actors"),
            blob_directory: root.join("blobs"),
            identity_file_cache_directory: root.join("identity_cache"),
        },
        auth: AuthConfig {
            jwt_secret: "integration-secret-integration-secret".to_string(),
            admin_password: "admin-pass".to_string(),
            plc_rotation_key_hex: None,
        },
        identity: IdentityConfig {
            did_plc_url: "https://plc.directory".to_string(),
            service_handle_domains: vec![".test".to_string()],
            cache_stale_ttl_secs: 3600,
            cache_max_ttl_secs: 86400,
            resolution_timeout_secs: 5,
        },
        invites: InviteConfig {
            required: invite_required,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
        },
    }
}

async fn test_server(invite_required: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), invite_required);
    let ctx = AppContext::new(config).await.unwrap();
    TestServer { _dir: dir, ctx }
}

fn account_input(handle: &str, invite: Option<String>) -> CreateAccountInput {
    CreateAccountInput {
        handle: handle.to_string(),
        email: Some(format!("{}@example.com", handle.replace('.', "-"))),
        password: Some("a-long-password".to_string()),
        invite_code: invite,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_invite_gated_account_creation_and_event_order() {
    let server = test_server(true).await;
    let ctx = &server.ctx;

    // Admin mints a single-use invite
    let codes = ctx
        .account_manager
        .create_invite_codes(1, 1, "admin", "admin")
        .await
        .unwrap();

    // Subscriber attached before the account exists
    let mut rx = ctx.sequencer.subscribe(None).await.unwrap();

    let result = ctx
        .account_creator
        .create_account(account_input("alice.test", Some(codes[0].clone())), None)
        .await
        .unwrap();
    assert!(result.did.starts_with("did:plc:"));
    assert_eq!(result.handle, "alice.test");
    assert!(!result.access_jwt.is_empty());
    assert!(!result.refresh_jwt.is_empty());

    // Exactly three events, in order, all for the new DID
    let events = vec![
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ];
    assert!(matches!(&events[0], SeqEvent::Identity { evt, .. } if evt.did == result.did));
    assert!(matches!(&events[1], SeqEvent::Commit { evt, .. } if evt.repo == result.did));
    assert!(matches!(
        &events[2],
        SeqEvent::Account { evt, .. } if evt.did == result.did && evt.active
    ));
    let seqs: Vec<i64> = events.iter().map(|e| e.seq()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_create_then_get_record_round_trip() {
    let server = test_server(false).await;
    let ctx = &server.ctx;
    let result = ctx
        .account_creator
        .create_account(account_input("writer.test", None), None)
        .await
        .unwrap();

    let transactor = ctx.transactor_for(&result.did).await.unwrap();
    let write = prepare_create(
        &result.did,
        "app.bsky.feed.post",
        None,
        &serde_json::json!({ "$type": "app.bsky.feed.post", "text": "hi" }),
        None,
        &ctx.tid_clock,
    )
    .unwrap();
    let write_cid = write.cid.unwrap();
    let uri = write.uri.clone();
    transactor.process_writes(vec![write], None).await.unwrap();

    // The indexed row carries the same CID computed at create time
    let records = ctx.actor_store.records(&result.did).await.unwrap();
    let row = records.get_record(&uri, None, false).await.unwrap().unwrap();
    assert_eq!(row.cid, write_cid.to_string());

    // And the block decodes back to the record body
    let blocks = ctx.actor_store.blocks(&result.did).await.unwrap();
    let bytes = blocks.get(&write_cid).await.unwrap().unwrap();
    let value = dag::json_from_ipld(&dag::decode(&bytes).unwrap());
    assert_eq!(value["text"], "hi");

    // Listing the collection finds it
    let page = records
        .list_for_collection(&ListRecordsParams {
            collection: "app.bsky.feed.post".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
}

#[tokio::test]
async fn test_stale_swap_commit_is_rejected_and_root_unchanged() {
    let server = test_server(false).await;
    let ctx = &server.ctx;
    let result = ctx
        .account_creator
        .create_account(account_input("swapper.test", None), None)
        .await
        .unwrap();
    let transactor = ctx.transactor_for(&result.did).await.unwrap();

    let first = transactor
        .process_writes(
            vec![prepare_create(
                &result.did,
                "app.bsky.feed.post",
                Some("one"),
                &serde_json::json!({ "$type": "app.bsky.feed.post", "text": "first" }),
                None,
                &ctx.tid_clock,
            )
            .unwrap()],
            None,
        )
        .await
        .unwrap();

    let blocks = ctx.actor_store.blocks(&result.did).await.unwrap();
    let root_before = blocks.get_root().await.unwrap().unwrap();

    // Old commit CID as swapCommit: reject, leave the root alone
    let old_root = first.prev.unwrap();
    let err = transactor
        .process_writes(
            vec![prepare_create(
                &result.did,
                "app.bsky.feed.post",
                Some("two"),
                &serde_json::json!({ "$type": "app.bsky.feed.post", "text": "second" }),
                None,
                &ctx.tid_clock,
            )
            .unwrap()],
            Some(old_root),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PdsError::BadCommitSwap));

    let root_after = blocks.get_root().await.unwrap().unwrap();
    assert_eq!(root_before.cid, root_after.cid);
    assert_eq!(root_before.rev, root_after.rev);
}

#[tokio::test]
async fn test_login_failures_look_identical() {
    let server = test_server(false).await;
    let ctx = &server.ctx;
    ctx.account_creator
        .create_account(account_input("real.test", None), None)
        .await
        .unwrap();

    let missing = ctx
        .account_manager
        .login("doesnotexist.test", "x")
        .await
        .unwrap_err();
    let wrong = ctx
        .account_manager
        .login("real.test", "wrong-password")
        .await
        .unwrap_err();
    assert!(matches!(missing, PdsError::AuthRequired(_)));
    assert!(matches!(wrong, PdsError::AuthRequired(_)));
    assert_eq!(missing.to_string(), wrong.to_string());
}

#[tokio::test]
async fn test_blob_lifecycle_through_record_delete() {
    let server = test_server(false).await;
    let ctx = &server.ctx;
    let result = ctx
        .account_creator
        .create_account(account_input("blobs.test", None), None)
        .await
        .unwrap();
    let did = result.did.clone();

    // Upload: stage temp bytes and track the metadata
    let data = b"png bytes go here".to_vec();
    let cid = blob_cid(&data);
    let temp_key = ctx.blob_store.put_temp(&did, &data).await.unwrap();
    let blob_index = ctx.actor_store.blobs(&did).await.unwrap();
    blob_index
        .track_untethered(&cid, "image/png", data.len() as i64, &temp_key)
        .await
        .unwrap();

    // A committing record promotes the blob
    let transactor = ctx.transactor_for(&did).await.unwrap();
    let record = serde_json::json!({
        "$type": "app.bsky.feed.post",
        "text": "with attachment",
        "embed": {
            "$type": "blob",
            "ref": { "$link": cid.to_string() },
            "mimeType": "image/png",
            "size": data.len()
        }
    });
    transactor
        .process_writes(
            vec![prepare_create(&did, "app.bsky.feed.post", Some("pic"), &record, None, &ctx.tid_clock).unwrap()],
            None,
        )
        .await
        .unwrap();
    assert!(ctx.blob_store.has_stored(&did, &cid).await.unwrap());

    // Deleting the only referencing record dereferences the blob
    transactor
        .process_writes(
            vec![prepare_delete(&did, "app.bsky.feed.post", "pic", None).unwrap()],
            None,
        )
        .await
        .unwrap();
    // The maintenance pass is idempotent on top of the inline delete
    jobs::sweep_actor_blobs(ctx, &did).await.unwrap();
    assert!(!ctx.blob_store.has_stored(&did, &cid).await.unwrap());
    assert!(blob_index.get_blob(&cid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_firehose_cursor_resume_after_writes() {
    let server = test_server(false).await;
    let ctx = &server.ctx;
    let result = ctx
        .account_creator
        .create_account(account_input("cursor.test", None), None)
        .await
        .unwrap();
    let transactor = ctx.transactor_for(&result.did).await.unwrap();
    for i in 0..3 {
        transactor
            .process_writes(
                vec![prepare_create(
                    &result.did,
                    "app.bsky.feed.post",
                    Some(&format!("p{}", i)),
                    &serde_json::json!({ "$type": "app.bsky.feed.post", "text": format!("post {}", i) }),
                    None,
                    &ctx.tid_clock,
                )
                .unwrap()],
                None,
            )
            .await
            .unwrap();
    }

    // Creation emitted 3 events; the writes 3 more. Resume from 4.
    let mut rx = ctx.sequencer.subscribe(Some(4)).await.unwrap();
    let a = rx.recv().await.unwrap();
    let b = rx.recv().await.unwrap();
    assert_eq!(a.seq(), 5);
    assert_eq!(b.seq(), 6);
    assert!(matches!(a, SeqEvent::Commit { .. }));
    assert!(matches!(b, SeqEvent::Commit { .. }));
}
