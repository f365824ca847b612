use std::fs;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use scenegate_kernel::AuditLedger;
use scenegate_kernel::audit::fs::FsAuditStore;
use tempfile::TempDir;

fn scenegate(root: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("scenegate")?;
    cmd.arg("--root").arg(root.path()).env_remove("SCENEGATE_ROOT");
    Ok(cmd)
}

fn seed_audit_log(root: &TempDir) -> Result<std::path::PathBuf> {
    let path = root.path().join("logs/audit.jsonl");
    let mut ledger = AuditLedger::open(FsAuditStore::open(&path)?)?;
    ledger.record("write", "object/rename", r#"{"action":"object/rename"}"#)?;
    ledger.record("lighting", "light/set-intensity", r#"{"action":"light/set-intensity"}"#)?;
    ledger.record("write", "object/delete", r#"{"action":"object/delete"}"#)?;
    Ok(path)
}

#[test]
fn help_lists_subcommands() -> Result<()> {
    let root = TempDir::new()?;
    scenegate(&root)?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("status"));
    Ok(())
}

#[test]
fn audit_verify_accepts_an_intact_chain() -> Result<()> {
    let root = TempDir::new()?;
    seed_audit_log(&root)?;
    scenegate(&root)?
        .args(["audit", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""valid":true"#))
        .stdout(predicate::str::contains(r#""entries":3"#));
    Ok(())
}

#[test]
fn audit_verify_reports_the_first_tampered_entry() -> Result<()> {
    let root = TempDir::new()?;
    let path = seed_audit_log(&root)?;
    let text = fs::read_to_string(&path)?;
    fs::write(&path, text.replacen("light/set-intensity", "light/set-intensitY", 1))?;

    scenegate(&root)?
        .args(["audit", "verify", "--log"])
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""valid":false"#))
        .stdout(predicate::str::contains(r#""index":1"#))
        .stderr(predicate::str::contains("audit chain broken at entry 1"));
    Ok(())
}

#[test]
fn status_without_a_bridge_fails_cleanly() -> Result<()> {
    let root = TempDir::new()?;
    scenegate(&root)?
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no status file"));
    Ok(())
}

#[test]
fn run_drains_the_mailbox_and_publishes_status() -> Result<()> {
    let root = TempDir::new()?;
    let inbox = root.path().join("airlock/inbox");
    fs::create_dir_all(&inbox)?;
    fs::write(
        inbox.join("rename.json"),
        r#"{"action":"object/rename","capability":"write","keys":["path","name"],"values":["Hair","Fringe"]}"#,
    )?;

    scenegate(&root)?
        .args(["run", "--no-http", "--tick-ms", "5", "--max-ticks", "3"])
        .assert()
        .success();

    let response = fs::read_to_string(root.path().join("airlock/outbox/res_rename.json"))?;
    assert!(response.contains("Fringe"), "{response}");
    assert!(!inbox.join("rename.json").exists());

    scenegate(&root)?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""state":"Stopped""#))
        .stdout(predicate::str::contains("editorState"));

    scenegate(&root)?
        .args(["audit", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""entries":1"#));
    Ok(())
}

#[test]
fn send_times_out_and_withdraws_the_request() -> Result<()> {
    let root = TempDir::new()?;
    scenegate(&root)?
        .args(["send", "status", "--timeout-ms", "150"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("request withdrawn"));
    let leftovers = fs::read_dir(root.path().join("airlock/inbox"))?.count();
    assert_eq!(leftovers, 0);
    Ok(())
}
