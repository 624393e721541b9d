use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE, Engine as _};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use shardscan_core::ledger::{LedgerClient, LedgerError, PrevBlocks, check_prev_blocks};
use shardscan_util::serde_helpers;
use tycho_types::cell::HashBytes;
use tycho_types::models::{BlockId, ShardIdent};

const DEFAULT_URL: &str = "https://toncenter.com/api/v2/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpLedgerConfig {
    /// Base url of the v2 HTTP API.
    ///
    /// Default: `https://toncenter.com/api/v2/`
    #[serde(with = "serde_helpers::string")]
    pub url: Url,

    /// Sent as the `X-API-Key` header.
    ///
    /// Default: `None`
    pub api_key: Option<String>,

    /// Default: `10s`
    #[serde(with = "serde_helpers::humantime")]
    pub request_timeout: Duration,

    pub retry: RetryConfig,
}

impl Default for HttpLedgerConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_URL).expect("shouldn't fail for a static url"),
            api_key: None,
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff for connection errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default: `500ms`
    #[serde(with = "serde_helpers::humantime")]
    pub min_delay: Duration,

    /// Default: `10s`
    #[serde(with = "serde_helpers::humantime")]
    pub max_delay: Duration,

    /// Default: `2.0`
    pub factor: f32,

    /// Retries after the first attempt.
    ///
    /// Default: `5`
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_times: 5,
        }
    }
}

/// Ledger client for toncenter-compatible HTTP API.
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: Url,
    retry_policy: ExponentialBuilder,
}

impl HttpLedgerClient {
    pub fn new(config: &HttpLedgerConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let mut value = reqwest::header::HeaderValue::from_str(api_key)
                .context("invalid api key header value")?;
            value.set_sensitive(true);
            headers.insert("X-API-Key", value);
        }

        let client = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build http client")?;

        // `Url::join` replaces the last segment without it
        let mut base_url = config.url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(config.retry.min_delay)
            .with_max_delay(config.retry.max_delay)
            .with_factor(config.retry.factor)
            .with_max_times(config.retry.max_times);

        Ok(Self {
            client,
            base_url,
            retry_policy,
        })
    }

    async fn get<R>(&self, method: &'static str, query: &[(&str, String)]) -> Result<R, LedgerError>
    where
        for<'de> R: Deserialize<'de>,
    {
        let url = self
            .base_url
            .join(method)
            .map_err(LedgerError::decode)?;

        (|| self.get_once(url.clone(), query))
            .retry(self.retry_policy)
            .when(|e| matches!(e, LedgerError::Connection(_)))
            .notify(|e, delay| {
                tracing::warn!(method, ?delay, "ledger request failed, retrying: {e:?}");
            })
            .await
    }

    async fn get_once<R>(&self, url: Url, query: &[(&str, String)]) -> Result<R, LedgerError>
    where
        for<'de> R: Deserialize<'de>,
    {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(LedgerError::connection)?;

        let status = response.status();
        let body = response.bytes().await.map_err(LedgerError::connection)?;
        tracing::trace!(%status, len = body.len(), "received ledger response");

        parse_response(status, &body)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn get_head(&self) -> Result<BlockId, LedgerError> {
        let info = self
            .get::<MasterchainInfo>("getMasterchainInfo", &[])
            .await?;
        let block_id = BlockId::try_from(info.last).map_err(LedgerError::decode)?;
        if !block_id.shard.is_masterchain() {
            return Err(LedgerError::decode(anyhow::anyhow!(
                "latest block is not a masterchain block: {block_id}"
            )));
        }
        Ok(block_id)
    }

    async fn get_shards(&self, mc_block_id: &BlockId) -> Result<Vec<BlockId>, LedgerError> {
        let shards = self
            .get::<Shards>("shards", &[("seqno", mc_block_id.seqno.to_string())])
            .await?;

        shards
            .shards
            .into_iter()
            .map(BlockId::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(LedgerError::decode)
    }

    async fn get_prev_blocks(&self, block_id: &BlockId) -> Result<PrevBlocks, LedgerError> {
        let query = [
            ("workchain", block_id.shard.workchain().to_string()),
            ("shard", (block_id.shard.prefix() as i64).to_string()),
            ("seqno", block_id.seqno.to_string()),
            ("root_hash", BASE64_STANDARD.encode(block_id.root_hash.0)),
            ("file_hash", BASE64_STANDARD.encode(block_id.file_hash.0)),
        ];
        let header = self.get::<BlockHeader>("getBlockHeader", &query).await?;

        let id = BlockId::try_from(header.id).map_err(LedgerError::decode)?;
        if id != *block_id {
            return Err(LedgerError::decode(anyhow::anyhow!(
                "header mismatch: requested {block_id}, received {id}"
            )));
        }

        let prev_blocks = header
            .prev_blocks
            .into_iter()
            .map(BlockId::try_from)
            .collect::<anyhow::Result<PrevBlocks>>()
            .map_err(LedgerError::decode)?;
        check_prev_blocks(block_id, &prev_blocks)?;

        Ok(prev_blocks)
    }
}

fn parse_response<R>(status: reqwest::StatusCode, body: &[u8]) -> Result<R, LedgerError>
where
    for<'de> R: Deserialize<'de>,
{
    // Errors are also wrapped into the envelope, so try it first
    match serde_json::from_slice::<ApiResponse<R>>(body) {
        Ok(ApiResponse {
            ok: true,
            result: Some(result),
            ..
        }) => Ok(result),
        Ok(ApiResponse {
            ok: true,
            result: None,
            ..
        }) => Err(LedgerError::decode(anyhow::anyhow!("empty result"))),
        Ok(ApiResponse { error, code, .. }) => Err(LedgerError::connection(anyhow::anyhow!(
            "api error (status: {status}, code: {code:?}): {}",
            error.as_deref().unwrap_or("unknown")
        ))),
        Err(_) if !status.is_success() => Err(LedgerError::connection(anyhow::anyhow!(
            "unexpected http status: {status}"
        ))),
        Err(e) => Err(LedgerError::decode(e)),
    }
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<i32>,
}

#[derive(Deserialize)]
struct MasterchainInfo {
    last: RawBlockId,
}

#[derive(Deserialize)]
struct Shards {
    shards: Vec<RawBlockId>,
}

#[derive(Deserialize)]
struct BlockHeader {
    id: RawBlockId,
    #[serde(default)]
    prev_blocks: Vec<RawBlockId>,
}

#[derive(Deserialize)]
struct RawBlockId {
    workchain: i32,
    shard: RawShard,
    seqno: u32,
    root_hash: String,
    file_hash: String,
}

/// Shard prefix as a signed integer, sometimes stringified.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawShard {
    Int(i64),
    Str(String),
}

impl TryFrom<RawBlockId> for BlockId {
    type Error = anyhow::Error;

    fn try_from(raw: RawBlockId) -> Result<Self, Self::Error> {
        let shard = match raw.shard {
            RawShard::Int(shard) => shard,
            RawShard::Str(shard) => shard
                .parse::<i64>()
                .with_context(|| format!("invalid shard: {shard}"))?,
        };
        let shard = ShardIdent::new(raw.workchain, shard as u64)
            .with_context(|| format!("invalid shard prefix: {}:{shard}", raw.workchain))?;

        Ok(BlockId {
            shard,
            seqno: raw.seqno,
            root_hash: parse_hash(&raw.root_hash).context("invalid root hash")?,
            file_hash: parse_hash(&raw.file_hash).context("invalid file hash")?,
        })
    }
}

fn parse_hash(value: &str) -> anyhow::Result<HashBytes> {
    let value = value.trim();
    let bytes = match value.len() {
        44 if value.contains(['-', '_']) => BASE64_URL_SAFE.decode(value)?,
        44 => BASE64_STANDARD.decode(value)?,
        64 => hex::decode(value)?,
        len => anyhow::bail!("unexpected hash length: {len}"),
    };

    let bytes = <[u8; 32]>::try_from(bytes.as_slice()).context("invalid hash length")?;
    Ok(HashBytes(bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const HASH_A: &str = "qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqo=";
    const HASH_B: &str = "u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7u7s=";

    fn raw_block(workchain: i32, shard: &str, seqno: u32) -> String {
        format!(
            r#"{{"@type":"ton.blockIdExt","workchain":{workchain},"shard":"{shard}","seqno":{seqno},"root_hash":"{HASH_A}","file_hash":"{HASH_B}"}}"#
        )
    }

    #[test]
    fn masterchain_info_is_parsed() {
        let body = format!(
            r#"{{"ok":true,"result":{{"@type":"blocks.masterchainInfo","last":{}}}}}"#,
            raw_block(-1, "-9223372036854775808", 42)
        );
        let info = parse_response::<MasterchainInfo>(StatusCode::OK, body.as_bytes()).unwrap();
        let block_id = BlockId::try_from(info.last).unwrap();

        assert_eq!(block_id.shard, ShardIdent::MASTERCHAIN);
        assert_eq!(block_id.seqno, 42);
        assert_eq!(block_id.root_hash, HashBytes([0xaa; 32]));
        assert_eq!(block_id.file_hash, HashBytes([0xbb; 32]));
    }

    #[test]
    fn numeric_and_split_shards_are_parsed() {
        let body = format!(
            r#"{{"ok":true,"result":{{"shards":[{},{}]}}}}"#,
            raw_block(0, "-4611686018427387904", 10),
            raw_block(0, "4611686018427387904", 11),
        );
        let shards = parse_response::<Shards>(StatusCode::OK, body.as_bytes()).unwrap();
        let shards = shards
            .shards
            .into_iter()
            .map(BlockId::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();

        let (left, right) = ShardIdent::BASECHAIN.split().unwrap();
        assert_eq!(shards[0].shard, right);
        assert_eq!(shards[1].shard, left);

        let raw: RawBlockId = serde_json::from_str(&format!(
            r#"{{"workchain":0,"shard":{},"seqno":1,"root_hash":"{HASH_A}","file_hash":"{HASH_B}"}}"#,
            i64::MIN
        ))
        .unwrap();
        assert_eq!(BlockId::try_from(raw).unwrap().shard, ShardIdent::BASECHAIN);
    }

    #[test]
    fn invalid_block_ids_are_rejected() {
        let zero_shard = serde_json::from_str::<RawBlockId>(&raw_block(0, "0", 1)).unwrap();
        assert!(BlockId::try_from(zero_shard).is_err());

        let bad_shard = serde_json::from_str::<RawBlockId>(&raw_block(0, "abc", 1)).unwrap();
        assert!(BlockId::try_from(bad_shard).is_err());

        assert!(parse_hash("abcd").is_err());
        assert_eq!(parse_hash(&"cc".repeat(32)).unwrap(), HashBytes([0xcc; 32]));
    }

    #[test]
    fn error_responses_are_classified() {
        let api_error = br#"{"ok":false,"error":"block not found","code":500}"#;
        let err = parse_response::<Shards>(StatusCode::INTERNAL_SERVER_ERROR, api_error);
        assert!(matches!(err, Err(LedgerError::Connection(_))));

        let gateway = b"<html>bad gateway</html>";
        let err = parse_response::<Shards>(StatusCode::BAD_GATEWAY, gateway);
        assert!(matches!(err, Err(LedgerError::Connection(_))));

        let garbage = br#"{"ok":true,"result":{"shards":"nope"}}"#;
        let err = parse_response::<Shards>(StatusCode::OK, garbage);
        assert!(matches!(err, Err(LedgerError::Decode(_))));

        let empty = br#"{"ok":true}"#;
        let err = parse_response::<Shards>(StatusCode::OK, empty);
        assert!(matches!(err, Err(LedgerError::Decode(_))));
    }

    /// Serves each response on its own connection, in order.
    async fn serve(responses: Vec<(u16, String)>) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let requests = requests.clone();
            async move {
                for (status, body) in responses {
                    let (mut socket, _) = listener.accept().await.unwrap();

                    let mut request = Vec::new();
                    let mut buffer = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buffer).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        request.extend_from_slice(&buffer[..n]);
                    }
                    requests.fetch_add(1, Ordering::Relaxed);

                    let response = format!(
                        "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    socket.shutdown().await.unwrap();
                }
            }
        });

        let url = Url::parse(&format!("http://{addr}/api/v2")).unwrap();
        (url, requests)
    }

    fn test_config(url: Url, max_times: usize) -> HttpLedgerConfig {
        HttpLedgerConfig {
            url,
            api_key: Some("test".to_owned()),
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2.0,
                max_times,
            },
        }
    }

    #[tokio::test]
    async fn connection_errors_are_retried() {
        let ok = format!(
            r#"{{"ok":true,"result":{{"last":{}}}}}"#,
            raw_block(-1, "-9223372036854775808", 7)
        );
        let (url, requests) = serve(vec![
            (503, "unavailable".to_owned()),
            (500, r#"{"ok":false,"error":"timeout","code":500}"#.to_owned()),
            (200, ok),
        ])
        .await;

        let client = HttpLedgerClient::new(&test_config(url, 3)).unwrap();
        let head = client.get_head().await.unwrap();
        assert_eq!(head.seqno, 7);
        assert_eq!(requests.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn decode_errors_are_not_retried() {
        let (url, requests) = serve(vec![
            (200, r#"{"ok":true,"result":{"last":42}}"#.to_owned()),
            (200, r#"{"ok":true,"result":{"last":42}}"#.to_owned()),
        ])
        .await;

        let client = HttpLedgerClient::new(&test_config(url, 3)).unwrap();
        let err = client.get_head().await.unwrap_err();
        assert!(matches!(err, LedgerError::Decode(_)), "{err:?}");
        assert_eq!(requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retries_are_limited() {
        let (url, requests) = serve(vec![(503, String::new()); 3]).await;

        let client = HttpLedgerClient::new(&test_config(url, 2)).unwrap();
        let err = client.get_head().await.unwrap_err();
        assert!(matches!(err, LedgerError::Connection(_)), "{err:?}");
        assert_eq!(requests.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn prev_blocks_are_checked_against_request() {
        let (left, _) = ShardIdent::BASECHAIN.split().unwrap();
        let requested = BlockId {
            shard: left,
            seqno: 5,
            root_hash: HashBytes([0xaa; 32]),
            file_hash: HashBytes([0xbb; 32]),
        };

        let header = format!(
            r#"{{"ok":true,"result":{{"@type":"blocks.header","id":{},"prev_blocks":[{}]}}}}"#,
            raw_block(0, "4611686018427387904", 5),
            raw_block(0, "-9223372036854775808", 4),
        );
        let wrong_header = format!(
            r#"{{"ok":true,"result":{{"id":{},"prev_blocks":[]}}}}"#,
            raw_block(0, "4611686018427387904", 6),
        );
        let (url, _) = serve(vec![(200, header), (200, wrong_header)]).await;
        let client = HttpLedgerClient::new(&test_config(url, 0)).unwrap();

        let prev = client.get_prev_blocks(&requested).await.unwrap();
        assert_eq!(prev.len(), 1);
        assert_eq!(prev[0].shard, ShardIdent::BASECHAIN);
        assert_eq!(prev[0].seqno, 4);

        let err = client.get_prev_blocks(&requested).await.unwrap_err();
        assert!(matches!(err, LedgerError::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn three_parents_are_rejected() {
        let (left, _) = ShardIdent::BASECHAIN.split().unwrap();
        let requested = BlockId {
            shard: left,
            seqno: 5,
            root_hash: HashBytes([0xaa; 32]),
            file_hash: HashBytes([0xbb; 32]),
        };

        let header = format!(
            r#"{{"ok":true,"result":{{"id":{},"prev_blocks":[{},{},{}]}}}}"#,
            raw_block(0, "4611686018427387904", 5),
            raw_block(0, "4611686018427387904", 4),
            raw_block(0, "4611686018427387904", 3),
            raw_block(0, "4611686018427387904", 2),
        );
        let (url, requests) = serve(vec![(200, header)]).await;
        let client = HttpLedgerClient::new(&test_config(url, 3)).unwrap();

        let err = client.get_prev_blocks(&requested).await.unwrap_err();
        assert!(matches!(err, LedgerError::Decode(_)), "{err:?}");
        assert_eq!(requests.load(Ordering::Relaxed), 1);
    }
}
