//! Method dispatcher for the RESP server

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use vidcache::{ByteRange, Error, VideoCache};

use crate::resp::Frame;

/// Snapshot returned by `STATS`
#[derive(Debug, Serialize)]
struct StatsReport {
    size: u64,
    capacity: u64,
    segments: usize,
    pending_fetches: usize,
    hits: u64,
    misses: u64,
    hit_ratio: f64,
    evictions: u64,
    inserts: u64,
    origin_requests: u64,
    coalesced: u64,
    retries: u64,
    failures: u64,
    cancellations: u64,
}

pub struct MethodHandler {
    cache: Arc<VideoCache>,
}

impl MethodHandler {
    pub fn new(cache: Arc<VideoCache>) -> Self {
        Self { cache }
    }

    /// Run one request frame and build its reply
    pub async fn handle(&self, request: Frame) -> Frame {
        let args = match request {
            Frame::Array(Some(items)) if !items.is_empty() => items,
            _ => return Frame::err("invalid request format"),
        };

        let args = match args.into_iter().map(bulk_arg).collect::<Option<Vec<Bytes>>>() {
            Some(args) => args,
            None => return Frame::err("request arguments must be bulk strings"),
        };

        let method = String::from_utf8_lossy(&args[0]).to_uppercase();
        let params = &args[1..];

        match method.as_str() {
            "PING" => self.ping(params),
            "READ" => self.read(params).await,
            "INVALIDATE" => self.invalidate(params),
            "CONTAINS" => self.contains(params),
            "SIZE" => Frame::Integer(self.cache.current_size() as i64),
            "STATS" => self.stats(),
            "COMMAND" => Frame::Array(Some(vec![])),
            _ => Frame::err(format!("not implemented: {}", method)),
        }
    }

    fn ping(&self, params: &[Bytes]) -> Frame {
        match params {
            [] => Frame::Simple("PONG".to_string()),
            [message] => Frame::Bulk(Some(message.clone())),
            _ => wrong_arity("ping"),
        }
    }

    async fn read(&self, params: &[Bytes]) -> Frame {
        let [resource, start, end] = params else {
            return wrong_arity("read");
        };
        let (resource, range) = match resource_range(resource, start, end) {
            Ok(parsed) => parsed,
            Err(reply) => return reply,
        };

        match self.cache.read(&resource, range).await {
            Ok(data) => Frame::Bulk(Some(data)),
            Err(e) => error_reply(&e),
        }
    }

    fn invalidate(&self, params: &[Bytes]) -> Frame {
        let [resource] = params else {
            return wrong_arity("invalidate");
        };
        let Some(resource) = text(resource) else {
            return Frame::err("resource must be UTF-8");
        };

        match self.cache.invalidate(&resource) {
            Ok(removed) => Frame::Integer(removed as i64),
            Err(e) => error_reply(&e),
        }
    }

    fn contains(&self, params: &[Bytes]) -> Frame {
        let [resource, start, end] = params else {
            return wrong_arity("contains");
        };
        match resource_range(resource, start, end) {
            Ok((resource, range)) => Frame::Integer(self.cache.contains(&resource, range) as i64),
            Err(reply) => reply,
        }
    }

    fn stats(&self) -> Frame {
        let stats = self.cache.stats();
        let report = StatsReport {
            size: self.cache.current_size(),
            capacity: self.cache.capacity(),
            segments: self.cache.len(),
            pending_fetches: self.cache.pending_fetches(),
            hits: stats.hits(),
            misses: stats.misses(),
            hit_ratio: stats.hit_ratio(),
            evictions: stats.evictions(),
            inserts: stats.inserts(),
            origin_requests: stats.origin_requests(),
            coalesced: stats.coalesced(),
            retries: stats.retries(),
            failures: stats.failures(),
            cancellations: stats.cancellations(),
        };

        match serde_json::to_vec(&report) {
            Ok(json) => Frame::bulk(json),
            Err(e) => Frame::err(e),
        }
    }
}

fn bulk_arg(frame: Frame) -> Option<Bytes> {
    match frame {
        Frame::Bulk(Some(data)) => Some(data),
        _ => None,
    }
}

fn text(arg: &Bytes) -> Option<String> {
    String::from_utf8(arg.to_vec()).ok()
}

fn resource_range(
    resource: &Bytes,
    start: &Bytes,
    end: &Bytes,
) -> Result<(String, ByteRange), Frame> {
    let resource = text(resource).ok_or_else(|| Frame::err("resource must be UTF-8"))?;
    let offset = |arg: &Bytes| {
        text(arg)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Frame::err("offsets must be unsigned integers"))
    };
    let range = ByteRange::new(offset(start)?, offset(end)?).map_err(Frame::err)?;
    Ok((resource, range))
}

fn wrong_arity(method: &str) -> Frame {
    Frame::err(format!("wrong number of arguments for '{}'", method))
}

fn error_reply(error: &Error) -> Frame {
    let code = match error {
        Error::Network(_) => "ORIGIN",
        Error::Full { .. } => "FULL",
        Error::Timeout(_) => "TIMEOUT",
        Error::Cancelled => "CANCELLED",
        Error::InvalidRange { .. } => "RANGE",
        Error::Closed => "CLOSED",
        Error::Store(_) => "STORE",
    };
    Frame::Error(format!("{} {}", code, error))
}
