use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::exposition::Exposition;
use super::{Memstats, Payload, QueryOutcome, SearchRequest, StatusSource, VectorService, WriteObject};
use crate::config::{
    Compression, CompressionSwitch, IndexType, MULTI_VECTOR_NAME, RunConfig,
};

const WRITE_TIMEOUT: Duration = Duration::from_secs(300);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_RETRIES: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// 单次批量删除的最大对象数
const DELETE_CHUNK: usize = 1000;

/// 通过 REST 和 GraphQL 接口访问 Weaviate
#[derive(Clone)]
pub struct WeaviateClient {
    http: Client,
    origin: String,
    metrics_url: String,
    targets: Arc<Vec<String>>,
    cfg: Arc<RunConfig>,
}

impl WeaviateClient {
    pub fn new(cfg: Arc<RunConfig>) -> Result<Self> {
        Ok(Self {
            http: build_http(&cfg)?,
            origin: format!("{}://{}", cfg.http_scheme, cfg.http_origin),
            metrics_url: format!("http://{}/metrics", cfg.metrics_origin),
            targets: Arc::new(cfg.target_vectors()),
            cfg,
        })
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.origin, path)).timeout(timeout);
        match &self.cfg.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn class_path(&self) -> String {
        format!("/v1/schema/{}", self.cfg.class_name)
    }

    /// 发送请求，网络错误、429 和 5xx 按指数退避重试，其余错误直接返回
    async fn send_with_retry(
        &self,
        what: &str,
        build: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> Result<Response> {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 0..=MAX_RETRIES {
            let err = match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if retryable(resp.status()) => anyhow!("{} 返回 {}", what, resp.status()),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    bail!("{} 失败: {} {}", what, status, body);
                }
                Err(e) => anyhow::Error::new(e).context(format!("{} 请求失败", what)),
            };
            if attempt == MAX_RETRIES {
                return Err(err.context(format!("重试 {} 次后仍然失败", MAX_RETRIES)));
            }
            warn!("{:#}，{:?} 后重试", err, backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        unreachable!()
    }

    async fn get_class(&self) -> Result<Value> {
        let resp = self
            .send_with_retry("读取集合配置", || self.request(Method::GET, &self.class_path(), ADMIN_TIMEOUT))
            .await?;
        Ok(resp.json().await?)
    }

    async fn put_class(&self, class: &Value) -> Result<()> {
        self.send_with_retry("更新集合配置", || {
            self.request(Method::PUT, &self.class_path(), ADMIN_TIMEOUT).json(class)
        })
        .await?;
        Ok(())
    }

    async fn read_metrics(&self) -> Result<String> {
        let resp = self.http.get(&self.metrics_url).timeout(ADMIN_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            bail!("读取指标失败: {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    fn object_json(&self, object: &WriteObject) -> Value {
        let mut value = json!({
            "class": self.cfg.class_name,
            "id": object.id.to_string(),
        });
        match &object.payload {
            Payload::Single(vector) if self.targets.is_empty() => value["vector"] = json!(vector),
            Payload::Single(vector) => {
                let vectors: Map<_, _> =
                    self.targets.iter().map(|name| (name.clone(), json!(vector))).collect();
                value["vectors"] = Value::Object(vectors);
            }
            Payload::Multi(rows) => value["vectors"] = json!({ MULTI_VECTOR_NAME: rows }),
        }
        if let Some(tenant) = &object.tenant {
            value["tenant"] = json!(tenant);
        }
        if let Some(category) = object.category {
            value["properties"] = json!({ "category": category.to_string() });
        }
        value
    }

    fn graphql_query(&self, request: &SearchRequest) -> String {
        let vector = match &request.payload {
            Payload::Single(vector) => json!(vector),
            Payload::Multi(rows) => json!(rows),
        };
        let targets = match self.targets.is_empty() {
            true => String::new(),
            false => format!(", targetVectors: {}", json!(*self.targets)),
        };

        let mut args = vec![
            format!("limit: {}", request.limit),
            format!("nearVector: {{vector: {}{}}}", vector, targets),
        ];
        if let Some(tenant) = &request.tenant {
            args.push(format!("tenant: {}", json!(tenant)));
        }
        if let Some(category) = request.category {
            args.push(format!(
                "where: {{path: [\"category\"], operator: Equal, valueText: \"{}\"}}",
                category
            ));
        }
        format!("{{ Get {{ {}({}) {{ _additional {{ id }} }} }} }}", self.cfg.class_name, args.join(", "))
    }
}

impl StatusSource for WeaviateClient {
    async fn shards_ready(&self) -> Result<bool> {
        #[derive(Deserialize)]
        struct Shard {
            status: String,
        }

        let path = format!("{}/shards", self.class_path());
        let resp = self.request(Method::GET, &path, ADMIN_TIMEOUT).send().await?.error_for_status()?;
        let shards: Vec<Shard> = resp.json().await?;
        Ok(!shards.is_empty() && shards.iter().all(|s| s.status == "READY"))
    }

    async fn queue_length(&self) -> Result<u64> {
        #[derive(Deserialize)]
        struct Nodes {
            #[serde(default)]
            nodes: Vec<Node>,
        }
        #[derive(Deserialize)]
        struct Node {
            #[serde(default)]
            shards: Option<Vec<Shard>>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Shard {
            class: String,
            #[serde(default)]
            vector_queue_length: i64,
        }

        let resp = self
            .request(Method::GET, "/v1/nodes?output=verbose", ADMIN_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let nodes: Nodes = resp.json().await?;
        Ok(nodes
            .nodes
            .iter()
            .flat_map(|n| n.shards.iter().flatten())
            .filter(|s| s.class == self.cfg.class_name && s.vector_queue_length > 0)
            .map(|s| s.vector_queue_length as u64)
            .sum())
    }

    async fn tombstones(&self) -> Result<f64> {
        let text = self.read_metrics().await?;
        Ok(Exposition::parse(&text)?.sum("vector_index_tombstones"))
    }
}

impl VectorService for WeaviateClient {
    async fn connect(&self) -> Result<Self> {
        let client = Self { http: build_http(&self.cfg)?, ..self.clone() };
        client
            .request(Method::GET, "/v1/.well-known/ready", ADMIN_TIMEOUT)
            .send()
            .await
            .and_then(Response::error_for_status)
            .with_context(|| format!("无法连接到 {}", client.origin))?;
        Ok(client)
    }

    async fn recreate_schema(&self) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &self.class_path(), ADMIN_TIMEOUT)
            .send()
            .await
            .context("删除集合失败")?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            bail!("删除集合失败: {}", resp.status());
        }

        let class = class_definition(&self.cfg);
        debug!("集合定义: {}", class);
        self.send_with_retry("创建集合", || {
            self.request(Method::POST, "/v1/schema", ADMIN_TIMEOUT).json(&class)
        })
        .await?;
        info!("已创建集合 {}", self.cfg.class_name);
        Ok(())
    }

    async fn add_tenant(&self, tenant: &str) -> Result<()> {
        let path = format!("{}/tenants", self.class_path());
        let body = json!([{ "name": tenant }]);
        self.send_with_retry("添加租户", || self.request(Method::POST, &path, ADMIN_TIMEOUT).json(&body))
            .await?;
        Ok(())
    }

    async fn write_objects(&self, objects: Vec<WriteObject>) -> Result<()> {
        let body = json!({ "objects": objects.iter().map(|o| self.object_json(o)).collect::<Vec<_>>() });
        let resp = self
            .send_with_retry("批量写入", || {
                self.request(Method::POST, "/v1/batch/objects", WRITE_TIMEOUT).json(&body)
            })
            .await?;

        let results: Vec<Value> = resp.json().await?;
        let errors: Vec<&Value> = results
            .iter()
            .filter_map(|r| r["result"]["errors"]["error"].as_array())
            .flatten()
            .collect();
        if let Some(first) = errors.first() {
            warn!("批量写入中有 {} 个对象失败，例如: {}", errors.len(), first["message"]);
        }
        Ok(())
    }

    async fn delete_objects(&self, ids: &[Uuid], tenant: Option<&str>) -> Result<()> {
        for chunk in ids.chunks(DELETE_CHUNK) {
            let body = json!({
                "match": {
                    "class": self.cfg.class_name,
                    "where": {
                        "path": ["id"],
                        "operator": "ContainsAny",
                        "valueTextArray": chunk.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                    },
                },
                "output": "minimal",
            });
            self.send_with_retry("批量删除", || {
                let req = self.request(Method::DELETE, "/v1/batch/objects", WRITE_TIMEOUT).json(&body);
                match tenant {
                    Some(tenant) => req.query(&[("tenant", tenant)]),
                    None => req,
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn update_ef(&self, ef: usize) -> Result<()> {
        let mut class = self.get_class().await?;
        let changed = for_each_index_config(&mut class, &self.targets, |config| {
            set_ef(config, self.cfg.index_type, ef)
        })?;
        if !changed {
            debug!("{} 索引没有可调整的 ef，跳过", self.cfg.index_type.as_str());
            return Ok(());
        }
        self.put_class(&class).await
    }

    async fn enable_compression(&self, compression: Compression, dimension: usize) -> Result<()> {
        let settings = compression_settings(&self.cfg, compression, Some(dimension))?;
        let mut class = self.get_class().await?;
        let index_type = self.cfg.index_type;
        for_each_index_config(&mut class, &self.targets, |config| {
            let config = match index_type {
                IndexType::Dynamic => &mut config["hnsw"],
                _ => config,
            };
            config[compression.key()] = settings.clone();
            Ok(true)
        })?;
        self.put_class(&class).await?;
        info!("已开启 {} 压缩，等待分片就绪", compression);
        Ok(())
    }

    async fn memstats(&self) -> Result<Memstats> {
        let text = self.read_metrics().await?;
        let metrics = Exposition::parse(&text)?;
        let gauge = |name| metrics.first(name).unwrap_or_default();
        Ok(Memstats {
            heap_alloc_bytes: gauge("go_memstats_heap_alloc_bytes"),
            heap_inuse_bytes: gauge("go_memstats_heap_inuse_bytes"),
            heap_sys_bytes: gauge("go_memstats_heap_sys_bytes"),
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<QueryOutcome> {
        let body = json!({ "query": self.graphql_query(request) });
        let resp = match self.request(Method::POST, "/v1/graphql", SEARCH_TIMEOUT).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Ok(QueryOutcome::Rejected(format!("查询超时: {}", e))),
            Err(e) => return Err(anyhow::Error::new(e).context("查询请求失败")),
        };
        let status = resp.status();
        match resp.json::<Value>().await {
            Ok(body) => Ok(parse_graphql(&body, &self.cfg.class_name)),
            Err(e) => Ok(QueryOutcome::Rejected(format!("无法解析查询响应 ({}): {}", status, e))),
        }
    }
}

fn build_http(cfg: &RunConfig) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(120))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .danger_accept_invalid_certs(cfg.http_scheme == "https")
        .build()?)
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// 对集合中每个向量索引的配置调用 `f`，返回是否有配置被修改
fn for_each_index_config(
    class: &mut Value,
    targets: &[String],
    mut f: impl FnMut(&mut Value) -> Result<bool>,
) -> Result<bool> {
    let mut changed = false;
    if targets.is_empty() {
        let config = &mut class["vectorIndexConfig"];
        if !config.is_object() {
            bail!("集合配置中缺少 vectorIndexConfig");
        }
        changed |= f(config)?;
    } else {
        for name in targets {
            let config = &mut class["vectorConfig"][name.as_str()]["vectorIndexConfig"];
            if !config.is_object() {
                bail!("集合配置中缺少命名向量 {}", name);
            }
            changed |= f(config)?;
        }
    }
    Ok(changed)
}

fn set_ef(config: &mut Value, index_type: IndexType, ef: usize) -> Result<bool> {
    match index_type {
        IndexType::Hnsw => config["ef"] = json!(ef),
        IndexType::Flat => match config.get_mut("bq") {
            Some(bq) if bq.is_object() => bq["rescoreLimit"] = json!(ef),
            _ => return Ok(false),
        },
        IndexType::Dynamic => {
            let hnsw = config.get_mut("hnsw").ok_or_else(|| anyhow!("dynamic 索引配置中缺少 hnsw"))?;
            if !hnsw.is_object() {
                bail!("dynamic 索引配置中的 hnsw 不是对象");
            }
            hnsw["ef"] = json!(ef);
        }
    }
    Ok(true)
}

/// 压缩配置，`dimension` 为 `None` 表示创建集合时的 auto 模式
fn compression_settings(
    cfg: &RunConfig,
    compression: Compression,
    dimension: Option<usize>,
) -> Result<Value> {
    Ok(match compression {
        Compression::Pq => {
            let segments = match dimension {
                Some(dimension) => {
                    if dimension % cfg.pq_ratio != 0 {
                        bail!("PQ ratio {} 与向量维度 {} 不兼容", cfg.pq_ratio, dimension);
                    }
                    dimension / cfg.pq_ratio
                }
                None => cfg.pq_segments,
            };
            json!({
                "enabled": true,
                "segments": segments,
                "trainingLimit": cfg.training_limit,
                "rescoreLimit": cfg.rescore_limit,
            })
        }
        Compression::Sq => json!({
            "enabled": true,
            "trainingLimit": cfg.training_limit,
            "rescoreLimit": cfg.rescore_limit,
        }),
        Compression::Lasq => json!({
            "enabled": true,
            "trainingLimit": cfg.training_limit,
        }),
    })
}

fn hnsw_config(cfg: &RunConfig) -> Value {
    let mut config = json!({
        "efConstruction": cfg.ef_construction,
        "maxConnections": cfg.max_connections,
        "cleanupIntervalSeconds": cfg.cleanup_interval_seconds,
        "flatSearchCutoff": cfg.flat_search_cutoff,
    });
    let auto = [(cfg.pq, Compression::Pq), (cfg.sq, Compression::Sq), (cfg.lasq, Compression::Lasq)]
        .into_iter()
        .find(|(switch, _)| *switch == CompressionSwitch::Auto);
    if let Some((_, compression)) = auto {
        // auto 模式下 dimension 不参与计算，不会失败
        if let Ok(settings) = compression_settings(cfg, compression, None) {
            config[compression.key()] = settings;
        }
    } else if cfg.bq {
        config["bq"] = json!({ "enabled": true, "rescoreLimit": cfg.rescore_limit, "cache": true });
    }
    config
}

fn vector_index_config(cfg: &RunConfig) -> Value {
    let mut config = match cfg.index_type {
        IndexType::Hnsw => hnsw_config(cfg),
        IndexType::Flat => match cfg.bq {
            true => json!({ "bq": { "enabled": true, "rescoreLimit": cfg.rescore_limit, "cache": cfg.cache } }),
            false => json!({}),
        },
        IndexType::Dynamic => json!({ "threshold": cfg.dynamic_threshold, "hnsw": hnsw_config(cfg) }),
    };
    config["distance"] = json!(cfg.distance.as_str());
    config["filterStrategy"] = json!(cfg.filter_strategy.as_str());
    if cfg.multi_vector_dimension > 0 {
        config["multivector"] = json!({ "enabled": true });
    }
    config
}

/// 根据运行配置生成集合定义
fn class_definition(cfg: &RunConfig) -> Value {
    let mut class = json!({
        "class": cfg.class_name,
        "description": "Created by vecbench",
        "multiTenancyConfig": { "enabled": cfg.num_tenants > 0 },
    });
    if cfg.shards > 1 {
        class["shardingConfig"] = json!({ "desiredCount": cfg.shards });
    }
    if cfg.replication_factor > 1 {
        class["replicationConfig"] = json!({ "factor": cfg.replication_factor });
    }
    if cfg.filter {
        class["properties"] = json!([{ "name": "category", "dataType": ["text"] }]);
    }

    let index_config = vector_index_config(cfg);
    let targets = cfg.target_vectors();
    if targets.is_empty() {
        class["vectorizer"] = json!("none");
        class["vectorIndexType"] = json!(cfg.index_type.as_str());
        class["vectorIndexConfig"] = index_config;
    } else {
        let vector_config: Map<_, _> = targets
            .into_iter()
            .map(|name| {
                let config = json!({
                    "vectorizer": { "none": {} },
                    "vectorIndexType": cfg.index_type.as_str(),
                    "vectorIndexConfig": index_config,
                });
                (name, config)
            })
            .collect();
        class["vectorConfig"] = Value::Object(vector_config);
    }
    class
}

fn parse_graphql(body: &Value, class: &str) -> QueryOutcome {
    if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
        return QueryOutcome::Rejected(errors.to_string());
    }
    let Some(hits) = body["data"]["Get"][class].as_array() else {
        return QueryOutcome::Rejected(format!("响应中缺少查询结果: {}", body));
    };
    let ids = hits
        .iter()
        .filter_map(|hit| hit["_additional"]["id"].as_str())
        .filter_map(|id| Uuid::parse_str(id).ok())
        .collect();
    QueryOutcome::Hits(ids)
}
