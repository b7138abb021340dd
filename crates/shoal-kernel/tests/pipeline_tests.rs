//! Pipeline and job control tests: conduits between stages, redirections,
//! result printing, background jobs, suspension and interruption.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::shell;
use shoal_kernel::{Job, JobStatus, ShellError, StageResult, Value, PIPE_EXCEPTION};

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ============================================================================
// Pipes
// ============================================================================

#[tokio::test]
async fn output_flows_between_stages() {
    let sh = shell();
    sh.run("echo hello | upper").await.unwrap();
    assert_eq!(sh.stdout(), "HELLO\n");
}

#[tokio::test]
async fn three_stage_pipeline() {
    let sh = shell();
    sh.run("echo a b | cat | upper").await.unwrap();
    assert_eq!(sh.stdout(), "A B\n");
}

#[tokio::test]
async fn last_stage_result_is_the_value() {
    let sh = shell();
    let result = sh.run("echo one | count").await.unwrap();
    assert_eq!(result, Value::Int(1));
    assert_eq!(sh.stdout(), "", "final results are returned, not printed");
}

#[tokio::test]
async fn upstream_results_are_printed_into_the_pipe() {
    let sh = shell();
    sh.run("list a b c | cat").await.unwrap();
    assert_eq!(sh.stdout(), "a\nb\nc\n");
}

#[tokio::test]
async fn format_pipe_switch_disables_printing() {
    let sh = shell();
    sh.run(".FormatPipe = false").await.unwrap();
    sh.run("list a b c | cat").await.unwrap();
    assert_eq!(sh.stdout(), "");
}

#[tokio::test]
async fn pipe_all_carries_stderr() {
    let sh = shell();
    sh.run("warn oops |& upper").await.unwrap();
    assert_eq!(sh.stdout(), "OOPS\n");
    assert_eq!(sh.stderr(), "");
}

#[tokio::test]
async fn upstream_failures_land_in_pipe_exception() {
    let sh = shell();
    let result = sh.run("fail upstream | echo downstream").await.unwrap();
    assert!(result.is_null());
    assert_eq!(sh.stdout(), "downstream\n");
    assert_eq!(sh.stderr(), "shoal: RuntimeError: upstream\n");

    let Value::Error(err) = sh.session.get(PIPE_EXCEPTION) else {
        panic!("expected pipe-exception to be set");
    };
    assert!(matches!(err.as_ref(), ShellError::PipeFailure(causes) if causes.len() == 1));

    sh.run("echo clean | cat").await.unwrap();
    assert!(sh.session.get(PIPE_EXCEPTION).is_null());
}

// ============================================================================
// Redirections
// ============================================================================

#[tokio::test]
async fn output_and_input_redirection() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    sh.session.set_cwd(dir.path());

    sh.run("echo first > out.txt").await.unwrap();
    sh.run("echo second >> out.txt").await.unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "first\nsecond\n");
    assert_eq!(sh.stdout(), "");

    sh.run("upper < out.txt").await.unwrap();
    assert_eq!(sh.stdout(), "FIRST\nSECOND\n");
}

#[tokio::test]
async fn redirect_targets_expand() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("expanded.txt");
    sh.session.put("target", Value::from(path.to_string_lossy().as_ref()));

    sh.run("echo via-variable > $target").await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "via-variable\n");
}

#[tokio::test]
async fn list_targets_fan_out() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    sh.session.set_cwd(dir.path());

    sh.run("files = [a.txt b.txt]; echo both > $files").await.unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "both\n");
    assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "both\n");
}

#[tokio::test]
async fn empty_target_fails() {
    let sh = shell();
    let err = sh.run("echo x > $nowhere").await.unwrap_err();
    assert!(err.to_string().contains("no such file or directory"), "{err}");
}

#[tokio::test]
async fn stderr_duplicated_onto_stdout() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    sh.session.set_cwd(dir.path());

    sh.run("warn both-streams > log.txt 2>&1").await.unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "both-streams\n");
    assert_eq!(sh.stderr(), "");
}

#[tokio::test]
async fn empty_statement_copies_input_to_output() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    sh.session.set_cwd(dir.path());
    std::fs::write(dir.path().join("in.txt"), "copied\n").unwrap();

    sh.run("< in.txt > out.txt").await.unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "copied\n");
}

#[tokio::test]
async fn heredoc_feeds_stdin() {
    let sh = shell();
    sh.run("upper <<EOF\nline one\nline two\nEOF\n").await.unwrap();
    assert_eq!(sh.stdout(), "LINE ONE\nLINE TWO\n");
}

#[tokio::test]
async fn heredoc_dash_strips_tabs() {
    let sh = shell();
    sh.run("cat <<-EOF\n\tindented\n\t\tdeeper\nEOF\n").await.unwrap();
    assert_eq!(sh.stdout(), "indented\ndeeper\n");
}

#[tokio::test]
async fn here_string_is_expanded() {
    let sh = shell();
    sh.run("name = world; upper <<< \"hello $name\"").await.unwrap();
    assert_eq!(sh.stdout(), "HELLO WORLD\n");
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn foreground_jobs_leave_the_table() {
    let sh = shell();
    sh.run("echo a | cat; echo b").await.unwrap();
    assert!(sh.session.jobs().is_empty());
    assert!(sh.session.foreground_job().is_none());
}

#[tokio::test]
async fn background_job_runs_on() {
    let sh = shell();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    sh.session.set_job_listener(Some(Arc::new(move |_job: &Job, _from: JobStatus, to: JobStatus| {
        sink.lock().unwrap().push(to);
    })));

    let result = sh.run("sleep 200 &").await.unwrap();
    assert!(result.is_null());

    let jobs = sh.session.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].command().starts_with("sleep 200"), "{}", jobs[0].command());
    let job = jobs[0].clone();

    let outcome = tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
    assert!(matches!(outcome, Some(StageResult::Value(Value::Null))));
    assert!(sh.session.jobs().is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Background, JobStatus::Done]);
}

#[tokio::test]
async fn background_job_stops_on_terminal_output() {
    let sh = shell();
    sh.run("echo later &").await.unwrap();
    let job = sh.session.jobs()[0].clone();

    eventually(|| job.status() == JobStatus::Suspended).await;
    assert_eq!(sh.stdout(), "");

    job.foreground().unwrap();
    tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
    assert_eq!(sh.stdout(), "later\n");
}

#[tokio::test]
async fn background_job_with_redirected_output_keeps_running() {
    let sh = shell();
    let dir = tempfile::tempdir().unwrap();
    sh.session.set_cwd(dir.path());

    sh.run("echo quiet > bg.txt &").await.unwrap();
    let path = dir.path().join("bg.txt");
    eventually(|| sh.session.jobs().is_empty()).await;
    assert_eq!(std::fs::read_to_string(path).unwrap(), "quiet\n");
}

#[tokio::test]
async fn interrupted_jobs_fail() {
    let sh = shell();
    sh.run("sleep 60000 &").await.unwrap();
    let job = sh.session.jobs()[0].clone();
    job.interrupt();

    let outcome = tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
    assert!(matches!(outcome, Some(StageResult::Failure(ShellError::Interrupted))));
    assert!(job.is_interrupted());
}

#[tokio::test]
async fn closing_the_session_cancels_jobs() {
    let sh = shell();
    sh.run("sleep 60000 &").await.unwrap();
    let job = sh.session.jobs()[0].clone();

    sh.session.close().await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
    assert!(matches!(outcome, Some(StageResult::Failure(_))));
}

#[tokio::test]
async fn nested_jobs_stay_out_of_the_table() {
    let sh = shell();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    sh.session.set_job_listener(Some(Arc::new(move |job: &Job, _from: JobStatus, to: JobStatus| {
        if to == JobStatus::Foreground {
            sink.lock().unwrap().push((job.id(), job.parent().map(|p| p.id())));
        }
    })));

    sh.run("f = { echo inside }; f").await.unwrap();
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3, "{seen:?}");
    assert!(seen[2].1.is_some(), "the closure's statement runs as a child job");
    assert_eq!(sh.stdout(), "inside\n");
}
