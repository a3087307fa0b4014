//! Binary smoke tests: each run happens in a scratch directory without a config file.

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;

fn report(price: u32) -> String
{
    format!("# Report\nPrice: {price} PLN\n\n# Notes\nNothing else.\n")
}

fn snapdiff(dir: &TempDir) -> Command
{
    let mut cmd = Command::cargo_bin("snapdiff").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("SNAPDIFF_LOG")
        .arg("--no-color")
        .arg("--store")
        .arg(
            dir.child("store")
                .path(),
        );
    cmd
}

#[test]
fn chunk_prints_json_and_caches()
{
    let tmp = TempDir::new().unwrap();
    tmp.child("page.txt")
        .write_str(&report(100))
        .unwrap();

    snapdiff(&tmp)
        .args(["chunk", "page.txt", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"chunks\"").and(predicate::str::contains("Price: 100 PLN")));

    tmp.child("store")
        .assert(predicate::path::is_dir());

    snapdiff(&tmp)
        .args(["chunk", "page.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("page").and(predicate::str::contains("(cached)")));
}

#[test]
fn diff_reports_the_price_change()
{
    let tmp = TempDir::new().unwrap();
    tmp.child("before.txt")
        .write_str(&report(100))
        .unwrap();
    tmp.child("after.txt")
        .write_str(&report(120))
        .unwrap();

    snapdiff(&tmp)
        .args(["diff", "before.txt", "after.txt"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("before -> after: 1 changed, 0 added, 0 removed")
                .and(predicate::str::contains("significant")),
        );
}

#[test]
fn diff_of_identical_files_is_minor()
{
    let tmp = TempDir::new().unwrap();
    tmp.child("a.txt")
        .write_str(&report(100))
        .unwrap();
    tmp.child("b.txt")
        .write_str(&report(100))
        .unwrap();

    snapdiff(&tmp)
        .args(["diff", "a.txt", "b.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 changed").and(predicate::str::contains("(minor)")));
}

#[test]
fn missing_snapshot_file_fails()
{
    let tmp = TempDir::new().unwrap();

    snapdiff(&tmp)
        .args(["chunk", "nope.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("read snapshot"));
}

#[test]
fn init_writes_config_once()
{
    let tmp = TempDir::new().unwrap();

    snapdiff(&tmp)
        .args(["init", "."])
        .assert()
        .success();

    tmp.child("snapdiff.toml")
        .assert(predicate::str::contains("[chunking]"));

    snapdiff(&tmp)
        .args(["init", "."])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn completions_go_to_stdout()
{
    let tmp = TempDir::new().unwrap();

    snapdiff(&tmp)
        .args(["completions", "bash", "--stdout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("snapdiff"));
}

#[test]
fn completions_need_a_destination()
{
    let tmp = TempDir::new().unwrap();

    snapdiff(&tmp)
        .args(["completions", "fish"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--out-dir <DIR> or --stdout"));

    snapdiff(&tmp)
        .args(["completions", "fish", "--out-dir", "comp"])
        .assert()
        .success();

    tmp.child("comp/snapdiff.fish")
        .assert(predicate::path::exists());
}
