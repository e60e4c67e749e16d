use assert_cmd::prelude::*;
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    fs::write(&env_path, "BIND_HTTP=127.0.0.1:0\nBIND_WS=127.0.0.1:0\n").unwrap();
    env_path.to_str().unwrap().to_string()
}

fn signed_event_json(content: &str) -> serde_json::Value {
    let secp = Secp256k1::new();
    let sk = [1u8; 32];
    let kp = Keypair::from_seckey_slice(&secp, &sk).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let created_at = 1u64;
    let kind = 1u32;
    let tags: Vec<Vec<String>> = vec![vec!["t".into(), "news".into()]];
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).unwrap();
    let hash = Sha256::digest(&data);
    let id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    serde_json::json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

#[test]
fn verify_cli_accepts_signed_event() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    let ev = signed_event_json("hello");
    let ev_path = dir.path().join("ev.json");
    fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();

    let out = Command::cargo_bin("tidepool")
        .unwrap()
        .args(["--env", &env_path, "verify", ev_path.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert_eq!(stdout.trim(), format!("ok {}", ev["id"].as_str().unwrap()));
}

#[test]
fn verify_cli_reports_each_bad_file() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);

    let good = signed_event_json("hello");
    let good_path = dir.path().join("good.json");
    fs::write(&good_path, serde_json::to_string(&good).unwrap()).unwrap();

    // id no longer matches the content
    let mut tampered = signed_event_json("hello");
    tampered["content"] = "goodbye".into();
    let tampered_path = dir.path().join("tampered.json");
    fs::write(&tampered_path, serde_json::to_string(&tampered).unwrap()).unwrap();

    let garbage_path = dir.path().join("garbage.json");
    fs::write(&garbage_path, "[1, 2, 3]").unwrap();

    let out = Command::cargo_bin("tidepool")
        .unwrap()
        .args([
            "--env",
            &env_path,
            "verify",
            good_path.to_str().unwrap(),
            tampered_path.to_str().unwrap(),
            garbage_path.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("ok "));
    assert!(lines[1].starts_with(&format!("invalid {}:", tampered_path.display())));
    assert!(lines[2].starts_with(&format!("invalid {}:", garbage_path.display())));
}

#[test]
fn missing_env_file_is_created() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("nested").join(".env");
    let ev_path = dir.path().join("ev.json");
    fs::write(&ev_path, serde_json::to_string(&signed_event_json("")).unwrap()).unwrap();

    Command::cargo_bin("tidepool")
        .unwrap()
        .args([
            "--env",
            env_path.to_str().unwrap(),
            "verify",
            ev_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let data = fs::read_to_string(&env_path).unwrap();
    assert!(data.contains("BIND_HTTP=127.0.0.1:7777"));
    assert!(data.contains("BIND_WS=127.0.0.1:7778"));
}

#[test]
fn publish_cli_fails_without_relay() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    Command::cargo_bin("tidepool")
        .unwrap()
        .args([
            "--env",
            &env_path,
            "publish",
            "--relay",
            &format!("ws://127.0.0.1:{port}/"),
            "--wait",
            "1",
            "hello",
        ])
        .assert()
        .failure();
}
