use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::RepoConfig;
use crate::error::Result;
use crate::flow::context::{FlowContext, ProcessOutcome, PullRequestRecord};
use crate::flow::Flow;
use crate::platform::types::PullRequest;
use crate::platform::ReviewPlatform;
use crate::process::{CommandRunner, ExecOptions, OutputSink};
use crate::vcs::Vcs;

/// Per-pull-request processing step.
#[async_trait]
pub trait PullRequestHandler: Send + Sync {
    /// Process one pull request inside its own run directory.
    /// `Ok(true)` marks success, `Ok(false)` a failed check; an error is a
    /// crash, reported on the pull request and retried on a later iteration.
    async fn process(
        &self,
        repo_dir: &Path,
        pull_request: &PullRequest,
        run_dir: &Path,
    ) -> Result<bool>;
}

enum Disposition {
    Process(u32),
    Done,
    GaveUp,
}

/// Flow that keeps one repository's open pull requests processed, with
/// bounded retries per pull request identity.
pub struct PullRequestProcessor {
    name: String,
    repo_owner: String,
    repo_name: String,
    max_attempts: u32,
    workdir: PathBuf,
    platform: Arc<dyn ReviewPlatform>,
    vcs: Arc<dyn Vcs>,
    handler: Arc<dyn PullRequestHandler>,
}

impl PullRequestProcessor {
    pub fn new(
        name: &str,
        repo: &RepoConfig,
        workdir: PathBuf,
        platform: Arc<dyn ReviewPlatform>,
        vcs: Arc<dyn Vcs>,
        handler: Arc<dyn PullRequestHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            repo_owner: repo.owner.clone(),
            repo_name: repo.name.clone(),
            max_attempts: repo.max_attempts,
            workdir,
            platform,
            vcs,
            handler,
        }
    }

    fn disposition(&self, context: &FlowContext, pr: &PullRequest) -> Disposition {
        match context.latest_for_id(&pr.id) {
            Some(record) if record.matches(&pr.id, &pr.base_ref_oid, &pr.head_ref_oid) => {
                if record.result == ProcessOutcome::Success {
                    Disposition::Done
                } else if record.attempt >= self.max_attempts {
                    Disposition::GaveUp
                } else {
                    Disposition::Process(record.attempt + 1)
                }
            }
            // no history, or a ref changed: new work
            _ => Disposition::Process(1),
        }
    }

    /// Fresh, isolated directory for one processing attempt. The name
    /// carries a timestamp and both ref hashes; a leftover directory with
    /// the same name is removed first.
    async fn prepare_run_dir(&self, pr: &PullRequest, attempt: u32) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let base = short_oid(&pr.base_ref_oid);
        let head = short_oid(&pr.head_ref_oid);
        let run_dir = self
            .workdir
            .join("runs")
            .join(format!("{stamp}-{base}-{head}-a{attempt}"));

        if run_dir.exists() {
            tokio::fs::remove_dir_all(&run_dir).await?;
        }
        tokio::fs::create_dir_all(&run_dir).await?;
        Ok(run_dir)
    }

    async fn run_iteration(&mut self, context: &mut FlowContext) -> Result<()> {
        let listing = self
            .platform
            .list_open_pull_requests(&self.repo_owner, &self.repo_name)
            .await?;

        let repo_dir = self.workdir.join(&self.repo_name);
        if repo_dir.is_dir() {
            tracing::debug!(dir = %repo_dir.display(), "Checking if the clone is a valid repository...");
            if !self.vcs.remote_ok(&repo_dir).await? {
                // left untouched; picked up again next iteration
                tracing::warn!(
                    dir = %repo_dir.display(),
                    "Directory does not look like a valid repository"
                );
                return Ok(());
            }
        } else {
            tracing::info!(
                url = %listing.clone_url,
                dir = %repo_dir.display(),
                "Cloning repository..."
            );
            self.vcs.clone_repo(&listing.clone_url, &repo_dir).await?;
        }

        tracing::debug!(count = listing.pull_requests.len(), "Open pull requests fetched");
        for pr in &listing.pull_requests {
            let attempt = match self.disposition(context, pr) {
                Disposition::Done => {
                    tracing::debug!(pr = %pr.id, "Pull request already processed");
                    continue;
                }
                Disposition::GaveUp => {
                    tracing::debug!(
                        pr = %pr.id,
                        max_attempts = self.max_attempts,
                        "Giving up on pull request"
                    );
                    continue;
                }
                Disposition::Process(attempt) => attempt,
            };

            let run_dir = self.prepare_run_dir(pr, attempt).await?;
            tracing::info!(
                pr = %pr.id,
                title = %pr.title,
                attempt = attempt,
                run_dir = %run_dir.display(),
                "Processing pull request..."
            );

            let result = match self.handler.process(&repo_dir, pr, &run_dir).await {
                Ok(true) => ProcessOutcome::Success,
                Ok(false) => ProcessOutcome::Failure,
                Err(err) => {
                    tracing::error!(
                        pr = %pr.id,
                        attempt = attempt,
                        error = %err,
                        "Pull request processing crashed"
                    );
                    self.platform
                        .add_comment(
                            &pr.id,
                            &format!("hypha: processing attempt {attempt} failed, see daemon logs"),
                        )
                        .await;
                    ProcessOutcome::Crashed
                }
            };

            tracing::info!(pr = %pr.id, attempt = attempt, result = ?result, "Pull request processed");
            context.push_record(PullRequestRecord {
                id: pr.id.clone(),
                base_ref_oid: pr.base_ref_oid.clone(),
                head_ref_oid: pr.head_ref_oid.clone(),
                result,
                attempt,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Flow for PullRequestProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_once(&mut self, context: &mut FlowContext) -> Result<()> {
        self.run_iteration(context).await
    }
}

fn short_oid(oid: &str) -> &str {
    oid.get(..8).unwrap_or(oid)
}

/// Default processing step: sync the clone to the pull request head and run
/// the configured check command in it, logging into the run directory.
pub struct CheckCommandHandler {
    command: Vec<String>,
    timeout: Duration,
    runner: CommandRunner,
    vcs: Arc<dyn Vcs>,
}

impl CheckCommandHandler {
    pub fn new(repo: &RepoConfig, vcs: Arc<dyn Vcs>) -> Self {
        Self {
            command: repo.check_command.clone(),
            timeout: Duration::from_secs(repo.check_timeout_secs),
            runner: CommandRunner::new(),
            vcs,
        }
    }
}

#[async_trait]
impl PullRequestHandler for CheckCommandHandler {
    async fn process(
        &self,
        repo_dir: &Path,
        pull_request: &PullRequest,
        run_dir: &Path,
    ) -> Result<bool> {
        self.vcs.fetch(repo_dir).await?;
        self.vcs.checkout(repo_dir, &pull_request.head_ref_oid).await?;
        self.vcs.clean(repo_dir).await?;

        let opts = ExecOptions {
            no_throw: true,
            timeout: Some(self.timeout),
            stdout: OutputSink::File(run_dir.join("stdout.log")),
            stderr: OutputSink::File(run_dir.join("stderr.log")),
        };
        let code = self.runner.execute(&self.command, Some(repo_dir), &opts).await?;
        Ok(code == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::error::AppError;
    use crate::platform::types::{PullRequestState, RepoPullRequests};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubPlatform {
        listing: Mutex<RepoPullRequests>,
        comments: Mutex<Vec<String>>,
    }

    impl StubPlatform {
        fn new(pull_requests: Vec<PullRequest>) -> Self {
            Self {
                listing: Mutex::new(RepoPullRequests {
                    repository_id: "R_1".to_string(),
                    clone_url: "git@example.com:owner/repo.git".to_string(),
                    pull_requests,
                }),
                comments: Mutex::new(Vec::new()),
            }
        }

        fn set_pull_requests(&self, pull_requests: Vec<PullRequest>) {
            self.listing.lock().unwrap().pull_requests = pull_requests;
        }

        fn comment_count(&self) -> usize {
            self.comments.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReviewPlatform for StubPlatform {
        async fn list_open_pull_requests(&self, _: &str, _: &str) -> Result<RepoPullRequests> {
            Ok(self.listing.lock().unwrap().clone())
        }

        async fn add_comment(&self, _subject_id: &str, body: &str) -> Option<String> {
            self.comments.lock().unwrap().push(body.to_string());
            Some("C_1".to_string())
        }

        async fn update_comment(&self, _: &str, _: &str) -> bool {
            true
        }
    }

    struct StubVcs {
        remote_valid: bool,
        clones: AtomicUsize,
    }

    impl StubVcs {
        fn new() -> Self {
            Self {
                remote_valid: true,
                clones: AtomicUsize::new(0),
            }
        }

        fn invalid() -> Self {
            Self {
                remote_valid: false,
                clones: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Vcs for StubVcs {
        async fn clone_repo(&self, _url: &str, destination: &Path) -> Result<()> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(destination)?;
            Ok(())
        }

        async fn checkout(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch(&self, _: &Path) -> Result<()> {
            Ok(())
        }

        async fn clean(&self, _: &Path) -> Result<()> {
            Ok(())
        }

        async fn remote_ok(&self, _: &Path) -> Result<bool> {
            Ok(self.remote_valid)
        }
    }

    struct StubHandler {
        results: Mutex<VecDeque<Result<bool>>>,
        calls: AtomicUsize,
    }

    impl StubHandler {
        fn with_results(results: Vec<Result<bool>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn always_crashing() -> Self {
            Self {
                results: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PullRequestHandler for StubHandler {
        async fn process(&self, _: &Path, _: &PullRequest, run_dir: &Path) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(run_dir.is_dir());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Process("handler crashed".to_string())))
        }
    }

    fn pr(id: &str, base: &str, head: &str) -> PullRequest {
        PullRequest {
            id: id.to_string(),
            title: "Test PR".to_string(),
            state: PullRequestState::Open,
            created_at: Utc::now(),
            base_ref_name: "main".to_string(),
            base_ref_oid: base.to_string(),
            head_ref_name: "feature".to_string(),
            head_ref_oid: head.to_string(),
        }
    }

    fn repo_config() -> RepoConfig {
        RepoConfig {
            owner: "owner".to_string(),
            name: "repo".to_string(),
            max_attempts: 3,
            check_command: vec!["true".to_string()],
            check_timeout_secs: 60,
        }
    }

    struct Fixture {
        processor: PullRequestProcessor,
        platform: Arc<StubPlatform>,
        vcs: Arc<StubVcs>,
        handler: Arc<StubHandler>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(
        pull_requests: Vec<PullRequest>,
        vcs: StubVcs,
        handler: StubHandler,
    ) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let platform = Arc::new(StubPlatform::new(pull_requests));
        let vcs = Arc::new(vcs);
        let handler = Arc::new(handler);
        let processor = PullRequestProcessor::new(
            "test",
            &repo_config(),
            tmp.path().to_path_buf(),
            Arc::clone(&platform) as Arc<dyn ReviewPlatform>,
            Arc::clone(&vcs) as Arc<dyn Vcs>,
            Arc::clone(&handler) as Arc<dyn PullRequestHandler>,
        );
        Fixture {
            processor,
            platform,
            vcs,
            handler,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_crashing_handler_exhausts_attempts_then_skips() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::new(),
            StubHandler::always_crashing(),
        );

        let mut context = FlowContext::default();
        for _ in 0..4 {
            f.processor.run_once(&mut context).await.unwrap();
        }

        // exactly max_attempts crashed records, then no more
        let records = context.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records.iter().all(|r| r.result == ProcessOutcome::Crashed));
        assert_eq!(f.handler.call_count(), 3);
        assert_eq!(f.platform.comment_count(), 3);
    }

    #[tokio::test]
    async fn test_successful_pull_request_is_not_reprocessed() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::new(),
            StubHandler::with_results(vec![Ok(true)]),
        );

        let mut context = FlowContext::default();
        f.processor.run_once(&mut context).await.unwrap();
        assert_eq!(context.records().len(), 1);
        assert_eq!(context.records()[0].result, ProcessOutcome::Success);

        f.processor.run_once(&mut context).await.unwrap();
        // no new record, handler not called again
        assert_eq!(context.records().len(), 1);
        assert_eq!(f.handler.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ref_change_restarts_attempt_counter() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::new(),
            StubHandler::with_results(vec![Ok(false), Ok(false), Ok(true)]),
        );

        let mut context = FlowContext::default();
        f.processor.run_once(&mut context).await.unwrap();
        f.processor.run_once(&mut context).await.unwrap();
        assert_eq!(context.records().last().unwrap().attempt, 2);

        // a new head commit makes this new work: attempt restarts at 1
        f.platform.set_pull_requests(vec![pr("PR_1", "b0", "h1")]);
        f.processor.run_once(&mut context).await.unwrap();

        let last = context.records().last().unwrap();
        assert_eq!(last.attempt, 1);
        assert_eq!(last.head_ref_oid, "h1");
        assert_eq!(last.result, ProcessOutcome::Success);
    }

    #[tokio::test]
    async fn test_failure_then_success() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::new(),
            StubHandler::with_results(vec![Ok(false), Ok(true)]),
        );

        let mut context = FlowContext::default();
        f.processor.run_once(&mut context).await.unwrap();
        f.processor.run_once(&mut context).await.unwrap();

        let results: Vec<_> = context.records().iter().map(|r| r.result).collect();
        assert_eq!(results, vec![ProcessOutcome::Failure, ProcessOutcome::Success]);
        // plain failures do not post comments
        assert_eq!(f.platform.comment_count(), 0);

        f.processor.run_once(&mut context).await.unwrap();
        assert_eq!(f.handler.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_clone_aborts_iteration_without_touching_it() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::invalid(),
            StubHandler::with_results(vec![Ok(true)]),
        );

        // the clone directory exists but fails the probe
        let repo_dir = f.processor.workdir.join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("marker"), "untouched").unwrap();

        let mut context = FlowContext::default();
        f.processor.run_once(&mut context).await.unwrap();

        assert_eq!(f.handler.call_count(), 0);
        assert!(context.records().is_empty());
        assert!(repo_dir.join("marker").exists());
        assert_eq!(f.vcs.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_clone_is_created() {
        let mut f = fixture(
            vec![pr("PR_1", "b0", "h0")],
            StubVcs::new(),
            StubHandler::with_results(vec![Ok(true)]),
        );

        let mut context = FlowContext::default();
        f.processor.run_once(&mut context).await.unwrap();

        assert_eq!(f.vcs.clones.load(Ordering::SeqCst), 1);
        assert_eq!(f.handler.call_count(), 1);

        // the clone is reused afterwards
        f.platform.set_pull_requests(vec![]);
        f.processor.run_once(&mut context).await.unwrap();
        assert_eq!(f.vcs.clones.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_oid() {
        assert_eq!(short_oid("aaaaaaaabbbbbbbb"), "aaaaaaaa");
        assert_eq!(short_oid("abc"), "abc");
    }
}
