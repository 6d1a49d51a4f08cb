use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};

const BIN: &str = env!("CARGO_BIN_EXE_rb-finder");

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn run(root: &Path, args: &[&str]) -> anyhow::Result<Output> {
    let index_dir = root.join(".idx");
    let mut cmd = Command::new(BIN);
    cmd.arg("-q")
        .arg("--root")
        .arg(root)
        .arg("--index-dir")
        .arg(&index_dir)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("RB_FINDER_ROOT")
        .env_remove("RB_FINDER_INDEX_DIR")
        .env("VISUAL", "true");
    Ok(cmd.output()?)
}

fn run_json(root: &Path, args: &[&str]) -> anyhow::Result<Value> {
    let out = run(root, args)?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

fn names(hits: &Value) -> Vec<String> {
    hits.as_array()
        .map(|a| {
            a.iter()
                .filter_map(|h| h["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn seed_corpus(root: &Path) -> anyhow::Result<()> {
    write_file(
        &root.join("app/models/user.rb"),
        "class User < ApplicationRecord\n  ROLES = %w[admin member].freeze\n\n  scope :active, -> { where(active: true) }\n\n  def self.find_by_email(email)\n  end\n\n  def full_name\n  end\nend\n",
    )?;
    write_file(
        &root.join("app/mailers/user_mailer.rb"),
        "class UserMailer < ApplicationMailer\n  def welcome\n  end\nend\n",
    )?;
    write_file(&root.join("lib/broken.rb"), "class Broken\n  def oops(\n")?;
    write_file(&root.join("vendor/gems/skip.rb"), "class Vendored\nend\n")?;
    write_file(&root.join("README.md"), "# not ruby\n")?;
    Ok(())
}

#[test]
fn build_search_update_status_clear_flow() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    seed_corpus(root)?;

    let build = run_json(root, &["build"])?;
    assert_eq!(build["files_processed"].as_u64(), Some(3));
    let failures = build["failures"].as_array().cloned().unwrap_or_default();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["path"].as_str(), Some("lib/broken.rb"));
    assert_eq!(failures[0]["kind"].as_str(), Some("syntax"));

    let prefix = run_json(root, &["search", "Us", "--type", "class"])?;
    assert_eq!(names(&prefix), vec!["UserMailer", "User"]);
    assert!(
        prefix
            .as_array()
            .into_iter()
            .flatten()
            .all(|h| h["match"] == "prefix")
    );

    let method = run_json(root, &["search", "find_by_email"])?;
    assert_eq!(method[0]["kind"].as_str(), Some("method"));
    assert_eq!(method[0]["class_level"].as_bool(), Some(true));
    assert_eq!(method[0]["enclosing"].as_str(), Some("User"));
    assert_eq!(method[0]["line"].as_u64(), Some(6));
    assert_eq!(method[0]["match"].as_str(), Some("exact"));

    let scope = run_json(root, &["search", "active", "--type", "scope"])?;
    assert_eq!(scope[0]["file"].as_str(), Some("app/models/user.rb"));

    let vendored = run_json(root, &["search", "Vendored"])?;
    assert_eq!(vendored, Value::Array(Vec::new()));

    let noop = run_json(root, &["update"])?;
    assert_eq!(noop, serde_json::json!({ "updated": false }));

    std::fs::remove_file(root.join("app/mailers/user_mailer.rb"))?;
    let update = run_json(root, &["update"])?;
    assert_eq!(update["updated"].as_bool(), Some(true));
    assert_eq!(
        update["deleted"],
        serde_json::json!(["app/mailers/user_mailer.rb"])
    );
    let after = run_json(root, &["search", "UserMailer"])?;
    assert_eq!(after, Value::Array(Vec::new()));

    let again = run_json(root, &["update"])?;
    assert_eq!(again, serde_json::json!({ "updated": false }));

    let status = run_json(root, &["status"])?;
    assert_eq!(status["index_present"].as_bool(), Some(true));
    assert_eq!(status["total_files"].as_u64(), Some(2));
    assert_eq!(status["watcher"]["active"].as_bool(), Some(false));

    run_json(root, &["clear"])?;
    let status = run_json(root, &["status"])?;
    assert_eq!(status["index_present"].as_bool(), Some(false));

    let missing = run_json(root, &["search", "User"])?;
    assert_eq!(missing, Value::Array(Vec::new()));
    Ok(())
}

#[test]
fn update_without_index_builds_everything() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_file(&root.join("a.rb"), "module Alpha\nend\n")?;

    let update = run_json(root, &["update"])?;
    assert_eq!(update["updated"].as_bool(), Some(true));
    assert_eq!(update["new"], serde_json::json!(["a.rb"]));
    Ok(())
}

#[test]
fn text_format_limit_and_implicit_search() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    seed_corpus(root)?;
    run_json(root, &["build"])?;

    let out = run(root, &["search", "User", "--format", "text", "--limit", "1"])?;
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("app/mailers/user_mailer.rb:1\tclass\tUserMailer"));

    let implicit = run_json(root, &["ROLES"])?;
    assert_eq!(implicit[0]["kind"].as_str(), Some("constant"));

    let opened = run_json(root, &["search", "welcome", "--open"])?;
    assert_eq!(names(&opened), vec!["welcome"]);
    Ok(())
}

#[cfg(unix)]
#[test]
fn writers_refuse_while_a_watcher_holds_the_lock() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_file(&root.join("a.rb"), "class A\nend\n")?;
    run_json(root, &["build"])?;

    // this test process is alive, so the lock reads as held
    let lock = root.join(".idx/watch.lock");
    std::fs::write(&lock, std::process::id().to_string())?;

    let refused = run(root, &["update"])?;
    assert!(!refused.status.success());
    assert!(String::from_utf8_lossy(&refused.stderr).contains("watcher"));

    let status = run_json(root, &["status"])?;
    assert_eq!(status["watcher"]["active"].as_bool(), Some(true));
    assert_eq!(
        status["watcher"]["pid"].as_u64(),
        Some(u64::from(std::process::id()))
    );

    let hits = run_json(root, &["search", "A"])?;
    assert_eq!(names(&hits), vec!["A"]);

    std::fs::write(&lock, i32::MAX.to_string())?;
    let status = run_json(root, &["status"])?;
    assert_eq!(status["watcher"]["active"].as_bool(), Some(false));
    assert_eq!(status["watcher"]["stale_lock_removed"].as_bool(), Some(true));
    assert!(!lock.exists());
    Ok(())
}
