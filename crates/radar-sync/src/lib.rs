//! Acquisition pipeline: root acquisition, competitor resolution and analysis handoff.

mod config;
mod summarize;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use radar_adapters::{
    normalize, FixtureProductSource, HttpProductSource, HttpSourceConfig, NormalizationError,
    ProductSource, RawPayload, SourceContext, SourceError,
};
use radar_core::{
    is_supported_domain, AcquisitionContext, AnalysisPayload, ProductFilter, ProductRecord,
};
use radar_storage::{
    HttpClientConfig, HttpFetcher, MemoryProductStore, PayloadArchive, PayloadKind,
    ProductStore, SqliteProductStore, StorageError,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};

pub use config::{LlmConfig, RadarConfig, SourceKind, StoreBackend, DEFAULT_CONFIG_FILE};
pub use summarize::{ChatCompletionsSummarizer, SummarizationError, Summarizer};

pub const CRATE_NAME: &str = "radar-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("acquisition failed: {0}")]
    Acquisition(#[source] SourceError),
    #[error("competitor discovery failed: {0}")]
    Discovery(#[source] SourceError),
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
    #[error("product {id} not found")]
    NotFound { id: String },
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("summarization failed: {0}")]
    Summarization(#[from] SummarizationError),
}

impl PipelineError {
    fn invalid_request(message: impl Into<String>) -> Self {
        PipelineError::Acquisition(SourceError::InvalidRequest(message.into()))
    }

    /// True when the caller supplied an unusable id, marketplace or parent.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            PipelineError::Acquisition(SourceError::InvalidRequest(_))
                | PipelineError::Discovery(SourceError::InvalidRequest(_))
        )
    }
}

/// Async mutex per key; holders of the same key run one at a time.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct RadarPipeline {
    store: Arc<dyn ProductStore>,
    source: Arc<dyn ProductSource>,
    archive: Option<PayloadArchive>,
    summarizer: Option<Arc<dyn Summarizer>>,
    http: Option<Arc<HttpFetcher>>,
    parent_locks: KeyedLocks,
}

impl RadarPipeline {
    pub fn new(store: Arc<dyn ProductStore>, source: Arc<dyn ProductSource>) -> Self {
        Self {
            store,
            source,
            archive: None,
            summarizer: None,
            http: None,
            parent_locks: KeyedLocks::default(),
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Attach the HTTP client shared by the collaborators so [`Self::shutdown`] can close it.
    pub fn with_http(mut self, http: Arc<HttpFetcher>) -> Self {
        self.http = Some(http);
        self
    }

    /// Stop outbound HTTP; later collaborator calls fail instead of queueing.
    pub async fn shutdown(&self) {
        if let Some(http) = &self.http {
            http.close().await;
            info!("outbound http closed");
        }
    }

    pub fn store(&self) -> &Arc<dyn ProductStore> {
        &self.store
    }

    pub fn source_id(&self) -> &'static str {
        self.source.source_id()
    }

    /// Fetch one listing by id, normalize it and upsert it as a root record.
    ///
    /// The store is only written after both fetch and normalization succeed.
    pub async fn acquire_product(
        &self,
        id: &str,
        locale_hint: Option<&str>,
        marketplace_domain: &str,
    ) -> Result<ProductRecord, PipelineError> {
        let (id, marketplace_domain, locale_hint) =
            validate_request(id, marketplace_domain, locale_hint)?;
        let ctx = SourceContext::new();
        let span = info_span!("acquire_product", run_id = %ctx.run_id, id, marketplace_domain);

        async {
            let raw = self
                .source
                .fetch_product(&ctx, id, locale_hint, marketplace_domain)
                .await
                .map_err(PipelineError::Acquisition)?;
            self.archive_raw(PayloadKind::Product, marketplace_domain, id, &ctx, &raw)
                .await;

            let draft = normalize(&raw)?;
            if draft.id != id {
                warn!(reported = %draft.id, "provider returned a different id than requested");
                return Err(PipelineError::Acquisition(SourceError::Malformed(format!(
                    "requested {id} but provider returned {}",
                    draft.id
                ))));
            }
            let acquisition =
                AcquisitionContext::root(marketplace_domain, locale_hint.map(ToString::to_string));
            let record = ProductRecord::from_draft(draft, &acquisition);
            self.store.upsert(record.clone()).await?;
            info!(id = %record.id, source = self.source.source_id(), "product acquired");
            Ok(record)
        }
        .instrument(span)
        .await
    }

    /// Return the competitor set of a stored parent, discovering it when absent or
    /// when `force_refresh` is set. A refresh replaces the whole set.
    pub async fn resolve_competitors(
        &self,
        parent_id: &str,
        marketplace_domain: &str,
        locale_hint: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<ProductRecord>, PipelineError> {
        let (parent_id, marketplace_domain, locale_hint) =
            validate_request(parent_id, marketplace_domain, locale_hint)
                .map_err(into_discovery_error)?;
        let ctx = SourceContext::new();
        let span = info_span!(
            "resolve_competitors",
            run_id = %ctx.run_id,
            parent_id,
            marketplace_domain,
            force_refresh
        );

        async {
            let _guard = self.parent_locks.lock(parent_id).await;

            let parent = self
                .store
                .get(parent_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound {
                    id: parent_id.to_string(),
                })?;
            if let Some(grandparent) = &parent.parent_id {
                return Err(PipelineError::Discovery(SourceError::InvalidRequest(format!(
                    "{parent_id} is a competitor of {grandparent}; only root products have competitors"
                ))));
            }

            let children = ProductFilter::children_of(parent_id);
            if !force_refresh {
                let existing = self.store.search(&children).await?;
                if !existing.is_empty() {
                    debug!(count = existing.len(), "returning stored competitors");
                    return Ok(existing);
                }
            }

            let raws = self
                .source
                .discover_competitors(&ctx, parent_id, marketplace_domain, locale_hint)
                .await
                .map_err(PipelineError::Discovery)?;
            self.archive_discovery(marketplace_domain, parent_id, &ctx, &raws)
                .await;

            let acquisition = AcquisitionContext::competitor_of(
                parent_id,
                marketplace_domain,
                locale_hint.map(ToString::to_string),
            );
            let records = competitor_records(parent_id, &raws, &acquisition)?;
            let discovered = raws.len();
            self.store.replace_children(parent_id, records).await?;

            let stored = self.store.search(&children).await?;
            info!(discovered, stored = stored.len(), "competitor set replaced");
            Ok(stored)
        }
        .instrument(span)
        .await
    }

    /// Parent plus its stored competitors. Never calls a collaborator.
    pub async fn build_analysis_payload(
        &self,
        parent_id: &str,
    ) -> Result<AnalysisPayload, PipelineError> {
        let parent_id = parent_id.trim();
        let parent = self
            .store
            .get(parent_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                id: parent_id.to_string(),
            })?;
        let competitors = self
            .store
            .search(&ProductFilter::children_of(parent_id))
            .await?;
        Ok(AnalysisPayload {
            parent,
            competitors,
        })
    }

    /// Build the payload, then hand it to the configured summarizer.
    pub async fn analyze_competitors(&self, parent_id: &str) -> Result<String, PipelineError> {
        let payload = self.build_analysis_payload(parent_id).await?;
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or(SummarizationError::NotConfigured)?;
        Ok(summarizer.summarize(&payload).await?)
    }

    async fn archive_raw(
        &self,
        kind: PayloadKind,
        marketplace_domain: &str,
        id: &str,
        ctx: &SourceContext,
        raw: &RawPayload,
    ) {
        let Some(archive) = &self.archive else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(raw) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "raw payload could not be serialized for archiving");
                return;
            }
        };
        match archive
            .archive(kind, marketplace_domain, id, ctx.started_at, &bytes)
            .await
        {
            Ok(archived) => debug!(
                path = %archived.relative_path.display(),
                deduplicated = archived.deduplicated,
                "raw payload archived"
            ),
            Err(err) => warn!(error = %err, "raw payload archive failed"),
        }
    }

    async fn archive_discovery(
        &self,
        marketplace_domain: &str,
        parent_id: &str,
        ctx: &SourceContext,
        raws: &[RawPayload],
    ) {
        if self.archive.is_some() {
            let batch = RawPayload::Array(raws.to_vec());
            self.archive_raw(PayloadKind::Discovery, marketplace_domain, parent_id, ctx, &batch)
                .await;
        }
    }
}

fn validate_request<'a>(
    id: &'a str,
    marketplace_domain: &'a str,
    locale_hint: Option<&'a str>,
) -> Result<(&'a str, &'a str, Option<&'a str>), PipelineError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(PipelineError::invalid_request("product id must not be empty"));
    }
    let marketplace_domain = marketplace_domain.trim();
    if !is_supported_domain(marketplace_domain) {
        return Err(PipelineError::invalid_request(format!(
            "unsupported marketplace domain {marketplace_domain:?}"
        )));
    }
    let locale_hint = locale_hint.map(str::trim).filter(|l| !l.is_empty());
    Ok((id, marketplace_domain, locale_hint))
}

fn into_discovery_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Acquisition(source) => PipelineError::Discovery(source),
        other => other,
    }
}

/// Normalize a discovery batch. One bad payload fails the batch; the parent itself
/// and repeated ids are dropped.
fn competitor_records(
    parent_id: &str,
    raws: &[RawPayload],
    acquisition: &AcquisitionContext,
) -> Result<Vec<ProductRecord>, PipelineError> {
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raws.len());
    for (index, raw) in raws.iter().enumerate() {
        let draft = normalize(raw).map_err(|err| {
            warn!(index, error = %err, "competitor payload rejected");
            err
        })?;
        if draft.id == parent_id {
            debug!(index, "skipping candidate that is the parent itself");
            continue;
        }
        if !seen.insert(draft.id.clone()) {
            debug!(index, id = %draft.id, "skipping repeated candidate");
            continue;
        }
        records.push(ProductRecord::from_draft(draft, acquisition));
    }
    Ok(records)
}

pub async fn build_store(config: &RadarConfig) -> anyhow::Result<Arc<dyn ProductStore>> {
    Ok(match config.store {
        StoreBackend::Memory => Arc::new(MemoryProductStore::new()),
        StoreBackend::Sqlite => Arc::new(
            SqliteProductStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening product store {}", config.database_url))?,
        ),
    })
}

pub fn build_http_fetcher(config: &RadarConfig) -> anyhow::Result<Arc<HttpFetcher>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    Ok(Arc::new(fetcher))
}

/// Wire store, source, archive and summarizer from configuration.
pub async fn build_pipeline(config: &RadarConfig) -> anyhow::Result<RadarPipeline> {
    let store = build_store(config).await?;
    let http = build_http_fetcher(config)?;

    let source: Arc<dyn ProductSource> = match config.source {
        SourceKind::Fixtures => Arc::new(FixtureProductSource::new(&config.fixtures_dir)),
        SourceKind::Api => Arc::new(HttpProductSource::new(
            HttpSourceConfig {
                base_url: config.api_base_url.clone(),
                api_key: config.api_key.clone(),
                max_competitors: config.max_competitors,
            },
            Arc::clone(&http),
        )),
    };

    let summarizer = ChatCompletionsSummarizer::new(
        config.llm.clone(),
        config.prompt_max_competitors,
        Arc::clone(&http),
    );
    let mut pipeline = RadarPipeline::new(store, source)
        .with_summarizer(Arc::new(summarizer))
        .with_http(http);
    if let Some(dir) = &config.artifacts_dir {
        pipeline = pipeline.with_archive(PayloadArchive::new(dir));
    }
    info!(
        store = ?config.store,
        source = pipeline.source_id(),
        archive = config.artifacts_dir.is_some(),
        "pipeline ready"
    );
    Ok(pipeline)
}

pub async fn build_pipeline_from_env() -> anyhow::Result<RadarPipeline> {
    let config = RadarConfig::load()?;
    build_pipeline(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    fn product_payload(id: &str, brand: Option<&str>) -> RawPayload {
        let mut payload = json!({
            "asin": id,
            "title": format!("Wireless Earbuds {id}"),
            "price": 25.99,
            "currency": "USD",
            "url": format!("https://www.amazon.com/dp/{id}"),
        });
        if let Some(brand) = brand {
            payload["brand"] = json!(brand);
        }
        payload
    }

    /// Source double with scripted responses and call counters.
    #[derive(Default)]
    struct ScriptedSource {
        products: std::sync::Mutex<HashMap<String, RawPayload>>,
        competitors: std::sync::Mutex<Vec<RawPayload>>,
        fail_fetch: AtomicBool,
        fail_discovery: AtomicBool,
        fetch_calls: AtomicUsize,
        discovery_calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn with_product(self, payload: RawPayload) -> Self {
            let id = payload["asin"].as_str().unwrap_or_default().to_string();
            self.products.lock().unwrap().insert(id, payload);
            self
        }

        fn set_competitors(&self, payloads: Vec<RawPayload>) {
            *self.competitors.lock().unwrap() = payloads;
        }
    }

    #[async_trait]
    impl ProductSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_product(
            &self,
            _ctx: &SourceContext,
            id: &str,
            _locale_hint: Option<&str>,
            marketplace_domain: &str,
        ) -> Result<RawPayload, SourceError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(SourceError::Malformed("provider unavailable".into()));
            }
            self.products
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| SourceError::NotListed {
                    id: id.to_string(),
                    marketplace_domain: marketplace_domain.to_string(),
                })
        }

        async fn discover_competitors(
            &self,
            _ctx: &SourceContext,
            _parent_id: &str,
            _marketplace_domain: &str,
            _locale_hint: Option<&str>,
        ) -> Result<Vec<RawPayload>, SourceError> {
            self.discovery_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_discovery.load(Ordering::SeqCst) {
                return Err(SourceError::Malformed("search unavailable".into()));
            }
            Ok(self.competitors.lock().unwrap().clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ProductStore for BrokenStore {
        async fn upsert(&self, _record: ProductRecord) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }

        async fn get(&self, _id: &str) -> Result<Option<ProductRecord>, StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }

        async fn search(&self, _filter: &ProductFilter) -> Result<Vec<ProductRecord>, StorageError> {
            Ok(Vec::new())
        }

        async fn list_all(&self) -> Result<Vec<ProductRecord>, StorageError> {
            Ok(Vec::new())
        }

        async fn replace_children(
            &self,
            _parent_id: &str,
            _records: Vec<ProductRecord>,
        ) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
    }

    struct EchoSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, payload: &AnalysisPayload) -> Result<String, SummarizationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} vs {}", payload.parent.id, payload.competitors.len()))
        }
    }

    fn pipeline_with(source: ScriptedSource) -> (RadarPipeline, Arc<ScriptedSource>) {
        let source = Arc::new(source);
        let pipeline = RadarPipeline::new(
            Arc::new(MemoryProductStore::new()),
            Arc::clone(&source) as Arc<dyn ProductSource>,
        );
        (pipeline, source)
    }

    #[tokio::test]
    async fn acquire_stamps_context_and_keeps_missing_brand_absent() {
        let (pipeline, _) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("B0CX23VSAS", None)));

        let record = pipeline
            .acquire_product(" B0CX23VSAS ", Some("83980"), "com")
            .await
            .unwrap();
        assert_eq!(record.id, "B0CX23VSAS");
        assert_eq!(record.brand, None);
        assert_eq!(record.parent_id, None);
        assert_eq!(record.locale_hint.as_deref(), Some("83980"));
        assert_eq!(record.marketplace_domain, "com");

        let stored = pipeline.store().get("B0CX23VSAS").await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn acquire_rejects_blank_id_without_calling_source() {
        let (pipeline, source) = pipeline_with(ScriptedSource::default());
        let err = pipeline.acquire_product("   ", None, "com").await.unwrap_err();
        assert!(err.is_invalid_request());
        let err = pipeline.acquire_product("B1", None, "nowhere").await.unwrap_err();
        assert!(err.is_invalid_request());
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_prior_record_unchanged() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("B1", Some("Acme"))));
        let before = pipeline.acquire_product("B1", None, "com").await.unwrap();

        source.fail_fetch.store(true, Ordering::SeqCst);
        let err = pipeline.acquire_product("B1", Some("10001"), "com").await.unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(_)));

        let after = pipeline.store().get("B1").await.unwrap().unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn acquire_rejects_provider_reporting_another_id() {
        let source = ScriptedSource::default().with_product(product_payload("B1", Some("Old")));
        let (pipeline, source) = pipeline_with(source);
        let before = pipeline.acquire_product("B1", None, "com").await.unwrap();

        source
            .products
            .lock()
            .unwrap()
            .insert("B1".into(), product_payload("B2", Some("Other")));
        let err = pipeline.acquire_product("B1", None, "com").await.unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(SourceError::Malformed(_))));

        assert_eq!(pipeline.store().get("B1").await.unwrap().unwrap(), before);
        assert!(pipeline.store().get("B2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unnormalizable_product_is_not_stored() {
        let (pipeline, _) = pipeline_with(
            ScriptedSource::default().with_product(json!({"asin": "B1", "title": "no link"})),
        );
        let err = pipeline.acquire_product("B1", None, "com").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Normalization(NormalizationError::MissingUrl { .. })
        ));
        assert!(pipeline.store().get("B1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reacquiring_overwrites_with_latest_values() {
        let source = ScriptedSource::default().with_product(product_payload("B1", Some("Old")));
        let (pipeline, source) = pipeline_with(source);
        pipeline.acquire_product("B1", None, "com").await.unwrap();

        source
            .products
            .lock()
            .unwrap()
            .insert("B1".into(), product_payload("B1", Some("New")));
        pipeline.acquire_product("B1", None, "com").await.unwrap();

        let all = pipeline.store().list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].brand.as_deref(), Some("New"));
    }

    #[tokio::test]
    async fn resolve_requires_stored_parent() {
        let (pipeline, source) = pipeline_with(ScriptedSource::default());
        let err = pipeline
            .resolve_competitors("B404", "com", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { ref id } if id == "B404"));
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn competitors_cannot_be_resolved_as_parents() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None)]);
        pipeline.acquire_product("P1", None, "com").await.unwrap();
        pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();

        source.set_competitors(vec![product_payload("G1", None)]);
        let err = pipeline
            .resolve_competitors("C1", "com", None, true)
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());
        assert!(matches!(err, PipelineError::Discovery(_)));
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.store().get("G1").await.unwrap().is_none());
        assert!(pipeline
            .store()
            .search(&ProductFilter::children_of("C1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn repeated_resolution_discovers_once() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None), product_payload("C2", None)]);
        pipeline.acquire_product("P1", None, "com").await.unwrap();

        let first = pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();
        let second = pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(first.iter().all(|c| c.parent_id.as_deref() == Some("P1")));
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_of_one_parent_discovers_once() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None)]);
        pipeline.acquire_product("P1", None, "com").await.unwrap();

        let (a, b) = tokio::join!(
            pipeline.resolve_competitors("P1", "com", None, false),
            pipeline.resolve_competitors("P1", "com", None, false),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_with_empty_discovery_clears_set() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None)]);
        pipeline.acquire_product("P1", None, "com").await.unwrap();
        pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();

        source.set_competitors(Vec::new());
        let refreshed = pipeline.resolve_competitors("P1", "com", None, true).await.unwrap();
        assert!(refreshed.is_empty());
        let payload = pipeline.build_analysis_payload("P1").await.unwrap();
        assert!(payload.competitors.is_empty());
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_bad_candidate_fails_refresh_and_keeps_prior_set() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("B0CX23VSAS", None)));
        source.set_competitors(vec![product_payload("OLD1", None)]);
        pipeline.acquire_product("B0CX23VSAS", None, "com").await.unwrap();
        let prior = pipeline
            .resolve_competitors("B0CX23VSAS", "com", None, false)
            .await
            .unwrap();

        source.set_competitors(vec![
            product_payload("C1", None),
            json!({"title": "no id", "url": "https://www.amazon.com/dp/X"}),
            product_payload("C3", None),
        ]);
        let err = pipeline
            .resolve_competitors("B0CX23VSAS", "com", None, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Normalization(NormalizationError::MissingId)
        ));

        let payload = pipeline.build_analysis_payload("B0CX23VSAS").await.unwrap();
        assert_eq!(payload.competitors, prior);
    }

    #[tokio::test]
    async fn discovery_failure_leaves_store_untouched() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None)]);
        pipeline.acquire_product("P1", None, "com").await.unwrap();
        pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();

        source.fail_discovery.store(true, Ordering::SeqCst);
        let err = pipeline
            .resolve_competitors("P1", "com", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Discovery(_)));
        assert_eq!(pipeline.store().list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn discovery_drops_parent_and_repeated_candidates() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![
            product_payload("C1", Some("First")),
            product_payload("P1", None),
            product_payload("C1", Some("Second")),
            product_payload("C2", None),
        ]);
        pipeline.acquire_product("P1", Some("83980"), "com").await.unwrap();

        let competitors = pipeline
            .resolve_competitors("P1", "com", Some("83980"), false)
            .await
            .unwrap();
        let ids = competitors.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["C1", "C2"]);
        assert_eq!(competitors[0].brand.as_deref(), Some("First"));
        assert_eq!(competitors[0].locale_hint.as_deref(), Some("83980"));

        let parent = pipeline.store().get("P1").await.unwrap().unwrap();
        assert!(parent.is_root());
    }

    #[tokio::test]
    async fn payload_for_parent_without_competitors_is_empty() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        pipeline.acquire_product("P1", None, "com").await.unwrap();

        let payload = pipeline.build_analysis_payload("P1").await.unwrap();
        assert_eq!(payload.parent.id, "P1");
        assert!(payload.competitors.is_empty());
        assert_eq!(source.discovery_calls.load(Ordering::SeqCst), 0);

        let missing = pipeline.build_analysis_payload("P2").await.unwrap_err();
        assert!(matches!(missing, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn analysis_builds_payload_before_summarizing() {
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        let err = pipeline.analyze_competitors("P1").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));

        pipeline.acquire_product("P1", None, "com").await.unwrap();
        let err = pipeline.analyze_competitors("P1").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Summarization(SummarizationError::NotConfigured)
        ));

        let summarizer = Arc::new(EchoSummarizer {
            calls: AtomicUsize::new(0),
        });
        let pipeline = RadarPipeline::new(
            Arc::clone(pipeline.store()),
            Arc::clone(&source) as Arc<dyn ProductSource>,
        )
        .with_summarizer(Arc::clone(&summarizer) as Arc<dyn Summarizer>);
        assert!(pipeline.analyze_competitors("missing").await.is_err());
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.analyze_competitors("P1").await.unwrap(), "P1 vs 0");
    }

    #[tokio::test]
    async fn storage_failures_surface_as_storage_errors() {
        let source = Arc::new(ScriptedSource::default().with_product(product_payload("P1", None)));
        let pipeline = RadarPipeline::new(Arc::new(BrokenStore), source);
        let err = pipeline.acquire_product("P1", None, "com").await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        let err = pipeline
            .resolve_competitors("P1", "com", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }

    #[tokio::test]
    async fn raw_payloads_are_archived_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, source) =
            pipeline_with(ScriptedSource::default().with_product(product_payload("P1", None)));
        source.set_competitors(vec![product_payload("C1", None)]);
        let pipeline = pipeline.with_archive(PayloadArchive::new(dir.path()));

        pipeline.acquire_product("P1", None, "com").await.unwrap();
        pipeline.resolve_competitors("P1", "com", None, false).await.unwrap();

        assert!(dir.path().join("product/com/P1").is_dir());
        assert!(dir.path().join("discovery/com/P1").is_dir());
    }

    #[tokio::test]
    async fn pipeline_builds_from_config_with_fixture_source() {
        let config = RadarConfig {
            store: StoreBackend::Memory,
            fixtures_dir: std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures"),
            ..RadarConfig::default()
        };
        let pipeline = build_pipeline(&config).await.unwrap();
        assert_eq!(pipeline.source_id(), "fixtures");

        let parent = pipeline
            .acquire_product("B0CX23VSAS", Some("83980"), "com")
            .await
            .unwrap();
        assert_eq!(parent.brand, None);
        let competitors = pipeline
            .resolve_competitors("B0CX23VSAS", "com", Some("83980"), false)
            .await
            .unwrap();
        assert_eq!(competitors.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_closes_outbound_http() {
        let config = RadarConfig {
            store: StoreBackend::Memory,
            fixtures_dir: std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures"),
            ..RadarConfig::default()
        };
        let pipeline = build_pipeline(&config).await.unwrap();
        pipeline
            .acquire_product("B0CX23VSAS", None, "com")
            .await
            .unwrap();

        pipeline.shutdown().await;
        let err = pipeline.analyze_competitors("B0CX23VSAS").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Summarization(SummarizationError::Fetch(
                radar_storage::FetchError::Closed
            ))
        ));
    }
}
