//! Recursive include expansion.

use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use globset::GlobBuilder;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use super::CancellationFlag;
use super::cache::{CacheEntry, Clock, FragmentCache, SystemClock, cache_key};
use super::directive::{IncludeDirective, IncludeIdentity, IncludeKind};
use crate::document::parse_yaml;
use crate::error::{FanOutLimit, IncludeError};
use crate::rules::{EvalContext, evaluate};
use crate::variables::PipelineContext;
use conduit_core::http::HttpClient;
use conduit_core::repository::Repository;
use conduit_core::{Error as CoreError, When};

/// Limits and timeouts of include expansion.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub max_includes: usize,
    pub max_depth: usize,
    /// Fetches of one level run concurrently up to this bound.
    pub concurrency: usize,
    pub remote_timeout: Duration,
    pub min_cache_ttl: Duration,
    pub max_exists_comparisons: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_includes: 150,
            max_depth: 100,
            concurrency: 8,
            remote_timeout: Duration::from_secs(10),
            min_cache_ttl: Duration::from_secs(60),
            max_exists_comparisons: crate::rules::DEFAULT_MAX_EXISTS_COMPARISONS,
        }
    }
}

/// The document one directive resolved to, plus what it included.
#[derive(Debug, Clone)]
pub struct ResolvedFragment {
    pub origin: IncludeDirective,
    /// The fragment as fetched, `include` key included.
    pub document: Value,
    pub fetched_at: DateTime<Utc>,
    pub cache_hit: bool,
    /// Fragments included from this one, in document order.
    pub nested: Vec<Arc<ResolvedFragment>>,
}

/// Repository and ref that relative includes are read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Scope {
    project: String,
    git_ref: String,
}

/// Resolves `include` directives against a repository and remote URLs.
pub struct IncludeResolver {
    repository: Arc<dyn Repository>,
    http: Arc<dyn HttpClient>,
    cache: Arc<dyn FragmentCache>,
    clock: Arc<dyn Clock>,
    options: ResolverOptions,
}

impl IncludeResolver {
    pub fn new(
        repository: Arc<dyn Repository>,
        http: Arc<dyn HttpClient>,
        cache: Arc<dyn FragmentCache>,
    ) -> Self {
        Self {
            repository,
            http,
            cache,
            clock: Arc::new(SystemClock),
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Resolve every include of `document`, recursively.
    ///
    /// Fragments come back in document order. Each call is one compilation:
    /// duplicates are fetched once, and the fan-out limits count from zero.
    pub async fn resolve_document(
        &self,
        document: &Value,
        ctx: &PipelineContext,
        cancel: &CancellationFlag,
    ) -> Result<Vec<Arc<ResolvedFragment>>, IncludeError> {
        let expansion = Expansion {
            resolver: self,
            variables: ctx.variables(),
            root_scope: Scope {
                project: ctx.project.clone(),
                git_ref: ctx.git_ref.clone(),
            },
            root_tree: ctx.tree.clone(),
            total: AtomicUsize::new(0),
            memo: Mutex::new(HashMap::new()),
            trees: tokio::sync::Mutex::new(HashMap::new()),
            permits: Semaphore::new(self.options.concurrency.max(1)),
            cancel: cancel.clone(),
        };

        let scope = expansion.root_scope.clone();
        let fragments = expansion.expand_level(document, &scope, &[], 1).await?;
        info!(
            includes = expansion.total.load(Ordering::SeqCst),
            "Resolved includes"
        );
        Ok(fragments)
    }
}

/// State of one `resolve_document` call.
struct Expansion<'a> {
    resolver: &'a IncludeResolver,
    variables: BTreeMap<String, String>,
    root_scope: Scope,
    root_tree: Option<Vec<String>>,
    total: AtomicUsize,
    memo: Mutex<HashMap<IncludeIdentity, Arc<ResolvedFragment>>>,
    trees: tokio::sync::Mutex<HashMap<Scope, Arc<Vec<String>>>>,
    permits: Semaphore,
    cancel: CancellationFlag,
}

impl<'a> Expansion<'a> {
    fn check_cancelled(&self) -> Result<(), IncludeError> {
        if self.cancel.is_cancelled() {
            Err(IncludeError::Cancelled)
        } else {
            Ok(())
        }
    }

    #[async_recursion]
    async fn expand_level(
        &self,
        document: &Value,
        scope: &Scope,
        chain: &[IncludeIdentity],
        depth: usize,
    ) -> Result<Vec<Arc<ResolvedFragment>>, IncludeError> {
        let Some(raw) = document.get("include") else {
            return Ok(Vec::new());
        };
        let options = &self.resolver.options;

        let parsed = IncludeDirective::parse_all(raw, options.min_cache_ttl)?;
        let directives = self.select(parsed, scope).await?;
        if directives.is_empty() {
            return Ok(Vec::new());
        }

        if depth > options.max_depth {
            return Err(IncludeError::FanOutExceeded {
                limit: FanOutLimit::Depth(options.max_depth),
            });
        }
        let total = self.total.fetch_add(directives.len(), Ordering::SeqCst) + directives.len();
        if total > options.max_includes {
            return Err(IncludeError::FanOutExceeded {
                limit: FanOutLimit::TotalIncludes(options.max_includes),
            });
        }

        for directive in &directives {
            let identity = directive.identity();
            if chain.contains(&identity) {
                let mut names: Vec<String> = chain.iter().map(ToString::to_string).collect();
                names.push(identity.to_string());
                return Err(IncludeError::CircularInclude { chain: names });
            }
        }

        debug!(depth, count = directives.len(), "Expanding include level");
        stream::iter(
            directives
                .into_iter()
                .map(|directive| self.resolve(directive, scope, chain, depth)),
        )
        .buffered(options.concurrency.max(1))
        .try_collect()
        .await
    }

    /// Scope local paths, expand wildcards and drop includes whose rules exclude them.
    async fn select(
        &self,
        directives: Vec<IncludeDirective>,
        scope: &Scope,
    ) -> Result<Vec<IncludeDirective>, IncludeError> {
        let mut selected = Vec::new();
        for mut directive in directives {
            if directive.kind == IncludeKind::Local {
                directive.project = Some(scope.project.clone());
                directive.git_ref = Some(scope.git_ref.clone());
            }

            if !directive.rules.is_empty() {
                let tree = self.tree(scope).await?;
                let ctx = EvalContext {
                    variables: &self.variables,
                    changed_paths: None,
                    changed_by_ref: &BTreeMap::new(),
                    tree: &tree,
                    max_exists_comparisons: self.resolver.options.max_exists_comparisons,
                };
                let decision = evaluate(directive.rules.rules(), &ctx, When::Always).map_err(|e| {
                    IncludeError::InvalidDirective(format!(
                        "rules of include `{}` are invalid: {}",
                        directive.location, e
                    ))
                })?;
                if !decision.is_some_and(|d| d.includes_job()) {
                    debug!(location = %directive.location, "Include skipped by rules");
                    continue;
                }
            }

            if directive.is_wildcard() {
                selected.extend(self.expand_wildcard(&directive, scope).await?);
            } else {
                selected.push(directive);
            }
        }
        Ok(selected)
    }

    async fn expand_wildcard(
        &self,
        directive: &IncludeDirective,
        scope: &Scope,
    ) -> Result<Vec<IncludeDirective>, IncludeError> {
        let glob = GlobBuilder::new(&directive.location)
            .literal_separator(true)
            .build()
            .map_err(|e| IncludeError::InvalidLocation {
                location: directive.location.clone(),
                message: e.to_string(),
            })?
            .compile_matcher();

        let tree = self.tree(scope).await?;
        let mut matches: Vec<&String> = tree.iter().filter(|path| glob.is_match(path.as_str())).collect();
        matches.sort();
        if matches.is_empty() {
            return Err(IncludeError::NotFound {
                location: directive.location.clone(),
            });
        }

        Ok(matches
            .into_iter()
            .map(|path| IncludeDirective {
                location: path.clone(),
                ..directive.clone()
            })
            .collect())
    }

    async fn tree(&self, scope: &Scope) -> Result<Arc<Vec<String>>, IncludeError> {
        if *scope == self.root_scope {
            if let Some(tree) = &self.root_tree {
                return Ok(Arc::new(tree.clone()));
            }
        }

        let mut trees = self.trees.lock().await;
        if let Some(tree) = trees.get(scope) {
            return Ok(tree.clone());
        }
        let listing = self
            .resolver
            .repository
            .list_files(&scope.project, &scope.git_ref)
            .await
            .map_err(|e| fetch_error(e, &scope.project, &format!("{}@{}", scope.project, scope.git_ref)))?;
        let listing = Arc::new(listing);
        trees.insert(scope.clone(), listing.clone());
        Ok(listing)
    }

    #[async_recursion]
    async fn resolve(
        &self,
        directive: IncludeDirective,
        scope: &Scope,
        chain: &[IncludeIdentity],
        depth: usize,
    ) -> Result<Arc<ResolvedFragment>, IncludeError> {
        self.check_cancelled()?;

        let identity = directive.identity();
        let seen = self.memo.lock().ok().and_then(|memo| memo.get(&identity).cloned());
        if let Some(fragment) = seen {
            debug!(include = %identity, "Reusing resolved include");
            return Ok(fragment);
        }

        let (document, fetched_at, cache_hit) = self.fetch(&directive).await?;

        let nested_scope = match directive.kind {
            IncludeKind::ProjectFile => Scope {
                project: directive.project.clone().unwrap_or_default(),
                git_ref: directive.git_ref.clone().unwrap_or_default(),
            },
            _ => scope.clone(),
        };
        let mut nested_chain = chain.to_vec();
        nested_chain.push(identity.clone());
        let nested = self
            .expand_level(&document, &nested_scope, &nested_chain, depth + 1)
            .await?;

        let fragment = Arc::new(ResolvedFragment {
            origin: directive,
            document,
            fetched_at,
            cache_hit,
            nested,
        });
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(identity, fragment.clone());
        }
        Ok(fragment)
    }

    async fn fetch(
        &self,
        directive: &IncludeDirective,
    ) -> Result<(Value, DateTime<Utc>, bool), IncludeError> {
        let resolver = self.resolver;
        let cacheable = matches!(directive.kind, IncludeKind::Remote | IncludeKind::Template);
        let ttl = directive.cache_ttl().filter(|_| cacheable);
        let key = cache_key(&directive.identity());

        if ttl.is_some() {
            if let Some(entry) = resolver.cache.get(&key) {
                if !entry.is_stale(resolver.clock.now()) {
                    debug!(location = %directive.location, "Include cache hit");
                    return Ok((entry.fragment, entry.fetched_at, true));
                }
                resolver.cache.invalidate(&key);
            }
        }

        let text = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| IncludeError::Cancelled)?;
            self.check_cancelled()?;
            self.read(directive).await?
        };
        self.check_cancelled()?;

        let document = parse_fragment(&text, &directive.location)?;
        let fetched_at = resolver.clock.now();
        if let Some(ttl) = ttl {
            resolver.cache.insert(CacheEntry {
                key,
                fragment: document.clone(),
                fetched_at,
                ttl,
            });
        }
        Ok((document, fetched_at, false))
    }

    async fn read(&self, directive: &IncludeDirective) -> Result<String, IncludeError> {
        let repository = &self.resolver.repository;
        let location = directive.location.as_str();
        let project = directive.project.as_deref().unwrap_or_default();
        let git_ref = directive.git_ref.as_deref().unwrap_or_default();

        debug!(kind = directive.kind.as_str(), location, "Fetching include");
        match directive.kind {
            IncludeKind::Local => repository
                .read_file(project, git_ref, location)
                .await
                .map_err(|e| fetch_error(e, project, location)),
            IncludeKind::ProjectFile => {
                if !repository.can_read(project).await {
                    return Err(IncludeError::AccessDenied {
                        project: project.to_string(),
                        location: location.to_string(),
                    });
                }
                repository
                    .read_file(project, git_ref, location)
                    .await
                    .map_err(|e| fetch_error(e, project, location))
            }
            IncludeKind::Template => repository
                .read_template(location)
                .await
                .map_err(|e| fetch_error(e, "templates", location)),
            IncludeKind::Artifact => {
                let job = directive.job.as_deref().unwrap_or_default();
                repository
                    .read_artifact(job, location)
                    .await
                    .map_err(|e| fetch_error(e, job, location))
            }
            IncludeKind::Remote => self.read_remote(location).await,
        }
    }

    async fn read_remote(&self, location: &str) -> Result<String, IncludeError> {
        let url = Url::parse(location).map_err(|e| IncludeError::InvalidLocation {
            location: location.to_string(),
            message: e.to_string(),
        })?;
        let response = self
            .resolver
            .http
            .get(&url, self.resolver.options.remote_timeout)
            .await
            .map_err(|e| IncludeError::FetchError {
                location: location.to_string(),
                reason: e.to_string(),
            })?;
        if !response.is_success() {
            return Err(IncludeError::FetchError {
                location: location.to_string(),
                reason: format!("HTTP status {}", response.status),
            });
        }
        Ok(response.text())
    }
}

fn fetch_error(err: CoreError, project: &str, location: &str) -> IncludeError {
    match err {
        CoreError::NotFound(_) => IncludeError::NotFound {
            location: location.to_string(),
        },
        CoreError::AccessDenied(_) => IncludeError::AccessDenied {
            project: project.to_string(),
            location: location.to_string(),
        },
        other => IncludeError::FetchError {
            location: location.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Parse fetched text; a fragment must be a mapping (an empty file is one).
fn parse_fragment(text: &str, location: &str) -> Result<Value, IncludeError> {
    let document = parse_yaml(text).map_err(|e| IncludeError::InvalidContent {
        location: location.to_string(),
        message: e.to_string(),
    })?;
    match document {
        Value::Object(_) => Ok(document),
        Value::Null => Ok(Value::Object(Default::default())),
        _ => Err(IncludeError::InvalidContent {
            location: location.to_string(),
            message: "content should be a hash".to_string(),
        }),
    }
}
