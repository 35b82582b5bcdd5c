//! Include expansion: fetching the fragments a document pulls in.

pub mod cache;
pub mod directive;
pub mod resolver;

pub use cache::{CacheEntry, Clock, FragmentCache, ManualClock, MemoryCache, NoCache, SystemClock};
pub use directive::{CachePolicy, IncludeDirective, IncludeIdentity, IncludeKind};
pub use resolver::{IncludeResolver, ResolvedFragment, ResolverOptions};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag that stops include expansion between fetches.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FanOutLimit, IncludeError};
    use crate::variables::{PipelineContext, PipelineContextBuilder};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use conduit_core::http::{HttpClient, HttpResponse};
    use conduit_core::repository::MemoryRepository;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use url::Url;

    /// Serves fixed bodies and counts requests.
    #[derive(Default)]
    struct StubHttp {
        bodies: HashMap<String, String>,
        delays: HashMap<String, Duration>,
        requests: AtomicUsize,
        completed: Mutex<Vec<String>>,
    }

    impl StubHttp {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.bodies.insert(url.to_string(), body.to_string());
            self
        }

        fn with_delay(mut self, url: &str, delay: Duration) -> Self {
            self.delays.insert(url.to_string(), delay);
            self
        }

        fn completed(&self) -> Vec<String> {
            self.completed.lock().unwrap().clone()
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for StubHttp {
        async fn get(&self, url: &Url, _timeout: Duration) -> conduit_core::Result<HttpResponse> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(url.as_str()) {
                tokio::time::sleep(*delay).await;
            }
            self.completed.lock().unwrap().push(url.to_string());
            Ok(match self.bodies.get(url.as_str()) {
                Some(body) => HttpResponse {
                    status: 200,
                    body: body.clone().into(),
                },
                None => HttpResponse {
                    status: 404,
                    body: Default::default(),
                },
            })
        }
    }

    fn context() -> PipelineContext {
        PipelineContextBuilder::new("app").with_ref("main").build()
    }

    fn resolver(repo: MemoryRepository, http: Arc<StubHttp>) -> IncludeResolver {
        IncludeResolver::new(Arc::new(repo), http, Arc::new(MemoryCache::new(100)))
    }

    async fn resolve(
        resolver: &IncludeResolver,
        document: Value,
    ) -> Result<Vec<Arc<ResolvedFragment>>, IncludeError> {
        resolver
            .resolve_document(&document, &context(), &CancellationFlag::new())
            .await
    }

    #[tokio::test]
    async fn test_local_and_nested_includes() {
        let repo = MemoryRepository::new()
            .with_file("app", "main", "ci/a.yml", "include: ci/b.yml\na: {script: x}")
            .with_file("app", "main", "ci/b.yml", "b: {script: y}");
        let resolver = resolver(repo, Arc::new(StubHttp::default()));

        let fragments = resolve(&resolver, json!({"include": "ci/a.yml"})).await.unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].origin.location, "ci/a.yml");
        assert_eq!(fragments[0].nested.len(), 1);
        assert_eq!(fragments[0].nested[0].document["b"]["script"], json!("y"));
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let resolver = resolver(MemoryRepository::new(), Arc::new(StubHttp::default()));
        let err = resolve(&resolver, json!({"include": "nope.yml"})).await.unwrap_err();
        assert_eq!(
            err,
            IncludeError::NotFound {
                location: "nope.yml".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cycles_of_any_length_are_detected() {
        for length in [1usize, 2, 5] {
            let mut repo = MemoryRepository::new();
            for i in 0..length {
                let next = (i + 1) % length;
                repo = repo.with_file("app", "main", &format!("c{}.yml", i), format!("include: c{}.yml", next));
            }
            let resolver = resolver(repo, Arc::new(StubHttp::default()));

            let err = resolve(&resolver, json!({"include": "c0.yml"})).await.unwrap_err();
            let IncludeError::CircularInclude { chain } = err else {
                panic!("expected a circular include for length {}", length);
            };
            assert_eq!(chain.len(), length + 1);
            assert_eq!(chain.first(), chain.last());
        }
    }

    #[tokio::test]
    async fn test_duplicate_includes_are_fetched_once() {
        let repo = MemoryRepository::new()
            .with_file("app", "main", "a.yml", "include: shared.yml")
            .with_file("app", "main", "b.yml", "include: shared.yml")
            .with_file("app", "main", "shared.yml", "s: {script: x}");
        let repo = Arc::new(repo);
        let resolver = IncludeResolver::new(
            repo.clone(),
            Arc::new(StubHttp::default()),
            Arc::new(NoCache),
        )
        .with_options(ResolverOptions {
            concurrency: 1,
            ..Default::default()
        });

        let fragments = resolver
            .resolve_document(&json!({"include": ["a.yml", "b.yml"]}), &context(), &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(fragments.len(), 2);
        // a.yml, b.yml and one read of shared.yml
        assert_eq!(repo.reads(), 3);
    }

    #[tokio::test]
    async fn test_fan_out_limit_fetches_nothing() {
        let http = Arc::new(StubHttp::default());
        let resolver = resolver(MemoryRepository::new(), http.clone()).with_options(ResolverOptions {
            max_includes: 100,
            ..Default::default()
        });
        let includes: Vec<String> = (0..1000)
            .map(|i| format!("https://example.com/{}.yml", i))
            .collect();

        let err = resolve(&resolver, json!({"include": includes})).await.unwrap_err();
        assert_eq!(
            err,
            IncludeError::FanOutExceeded {
                limit: FanOutLimit::TotalIncludes(100)
            }
        );
        assert_eq!(http.requests(), 0);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let mut repo = MemoryRepository::new();
        for i in 0..5 {
            repo = repo.with_file("app", "main", &format!("d{}.yml", i), format!("include: d{}.yml", i + 1));
        }
        repo = repo.with_file("app", "main", "d5.yml", "{}");
        let resolver = resolver(repo, Arc::new(StubHttp::default())).with_options(ResolverOptions {
            max_depth: 3,
            ..Default::default()
        });

        let err = resolve(&resolver, json!({"include": "d0.yml"})).await.unwrap_err();
        assert_eq!(
            err,
            IncludeError::FanOutExceeded {
                limit: FanOutLimit::Depth(3)
            }
        );
    }

    #[tokio::test]
    async fn test_remote_cache_within_ttl() {
        let url = "https://example.com/ci.yml";
        let http = Arc::new(StubHttp::default().with(url, "remote: {script: x}"));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let resolver = resolver(MemoryRepository::new(), http.clone()).with_clock(clock.clone());
        let document = json!({"include": {"remote": url, "cache": "5m"}});

        let first = resolve(&resolver, document.clone()).await.unwrap();
        assert!(!first[0].cache_hit);
        let second = resolve(&resolver, document.clone()).await.unwrap();
        assert!(second[0].cache_hit);
        assert_eq!(http.requests(), 1);

        clock.advance(Duration::from_secs(301));
        let third = resolve(&resolver, document).await.unwrap();
        assert!(!third[0].cache_hit);
        assert_eq!(http.requests(), 2);
    }

    #[tokio::test]
    async fn test_uncached_remote_and_fetch_errors() {
        let http = Arc::new(StubHttp::default().with("https://example.com/ok.yml", "ok: {script: x}"));
        let resolver = resolver(MemoryRepository::new(), http.clone());

        resolve(&resolver, json!({"include": "https://example.com/ok.yml"})).await.unwrap();
        resolve(&resolver, json!({"include": "https://example.com/ok.yml"})).await.unwrap();
        assert_eq!(http.requests(), 2);

        let err = resolve(&resolver, json!({"include": "https://example.com/missing.yml"}))
            .await
            .unwrap_err();
        assert!(matches!(err, IncludeError::FetchError { .. }));
    }

    #[tokio::test]
    async fn test_project_access_denied() {
        let repo = MemoryRepository::new()
            .with_file("group/secret", "HEAD", "ci.yml", "x: {script: y}")
            .deny("group/secret");
        let resolver = resolver(repo, Arc::new(StubHttp::default()));

        let err = resolve(&resolver, json!({"include": {"project": "group/secret", "file": "ci.yml"}}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IncludeError::AccessDenied {
                project: "group/secret".to_string(),
                location: "ci.yml".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_local_includes_inside_project_files_use_that_project() {
        let repo = MemoryRepository::new()
            .with_file("group/lib", "v1", "entry.yml", "include: jobs.yml")
            .with_file("group/lib", "v1", "jobs.yml", "lib: {script: x}")
            .with_file("app", "main", "jobs.yml", "wrong: {script: x}");
        let resolver = resolver(repo, Arc::new(StubHttp::default()));

        let fragments = resolve(
            &resolver,
            json!({"include": {"project": "group/lib", "ref": "v1", "file": "entry.yml"}}),
        )
        .await
        .unwrap();
        assert!(fragments[0].nested[0].document.get("lib").is_some());
    }

    #[tokio::test]
    async fn test_wildcards_and_rules() {
        let repo = MemoryRepository::new()
            .with_file("app", "main", "configs/b.yml", "b: {script: x}")
            .with_file("app", "main", "configs/a.yml", "a: {script: x}")
            .with_file("app", "main", "configs/nested/c.yml", "c: {script: x}")
            .with_file("app", "main", "deploy.yml", "deploy: {script: x}");
        let resolver = resolver(repo, Arc::new(StubHttp::default()));

        let fragments = resolve(
            &resolver,
            json!({"include": [
                "configs/*.yml",
                {"local": "deploy.yml", "rules": [{"if": "$CI_COMMIT_REF_NAME == 'main'", "when": "never"}]}
            ]}),
        )
        .await
        .unwrap();
        let locations: Vec<_> = fragments.iter().map(|f| f.origin.location.as_str()).collect();
        assert_eq!(locations, vec!["configs/a.yml", "configs/b.yml"]);

        let err = resolve(&resolver, json!({"include": "missing/*.yml"})).await.unwrap_err();
        assert!(matches!(err, IncludeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let repo = MemoryRepository::new().with_file("app", "main", "a.yml", "{}");
        let resolver = resolver(repo, Arc::new(StubHttp::default()));
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let err = resolver
            .resolve_document(&json!({"include": "a.yml"}), &context(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, IncludeError::Cancelled);
    }

    #[tokio::test]
    async fn test_fragment_order_ignores_completion_order() {
        let urls: Vec<String> = (0..3).map(|i| format!("https://example.com/{}.yml", i)).collect();
        let mut http = StubHttp::default();
        for (i, url) in urls.iter().enumerate() {
            http = http
                .with(url, &format!("image: img{}\njob{}: {{script: x}}", i, i))
                .with_delay(url, Duration::from_millis(60 - 20 * i as u64));
        }
        let http = Arc::new(http);
        let resolver = resolver(MemoryRepository::new(), http.clone());

        let document = json!({"include": urls});
        let fragments = resolve(&resolver, document.clone()).await.unwrap();

        let mut completed = http.completed();
        completed.reverse();
        assert_eq!(completed, urls);

        let origins: Vec<&str> = fragments.iter().map(|f| f.origin.location.as_str()).collect();
        assert_eq!(origins, urls.iter().map(String::as_str).collect::<Vec<_>>());

        let merged = crate::merge::merge_fragments(&document, &fragments);
        assert_eq!(merged["image"], json!("img2"));
        let jobs: Vec<&str> = merged
            .as_object()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with("job"))
            .map(String::as_str)
            .collect();
        assert_eq!(jobs, vec!["job0", "job1", "job2"]);
    }
}
