//! In-memory engine library for the library and worker transports

use async_trait::async_trait;
use parking_lot::Mutex;
use query_engine_host::library::{
    InstanceOptions, LibraryLoader, LibraryVersion, LogCallback, NativeError, NativeMethod,
    QueryEngineInstance, QueryEngineLibrary, StaticLibraryLoader,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const COMMIT: &str = "0123abcd";
pub const PANIC_LINE: &str =
    r#"{"is_panic":true,"message":"called `Option::unwrap()` on a `None` value in query-engine/src/lib.rs:10:5"}"#;

/// Knobs and counters shared by the library and its instances
#[derive(Default)]
pub struct FakeBehavior {
    /// Structured error returned by the next instance creation
    pub init_error: Mutex<Option<Value>>,
    /// The next query fails with a native panic
    pub panic_on_next_query: AtomicBool,
    /// The next connect reports a panic through the log callback
    pub log_panic_on_connect: AtomicBool,
    pub instances: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub calls: Mutex<Vec<(NativeMethod, Value)>>,
    pub last_options: Mutex<Option<InstanceOptions>>,
}

impl FakeBehavior {
    pub fn count(&self, method: NativeMethod) -> usize {
        self.calls.lock().iter().filter(|(m, _)| *m == method).count()
    }
}

pub struct FakeLibrary {
    behavior: Arc<FakeBehavior>,
}

/// Loader handing out a fresh fake library plus its behavior handle
pub fn fake_loader() -> (Arc<dyn LibraryLoader>, Arc<FakeBehavior>) {
    let behavior = Arc::new(FakeBehavior::default());
    let library = Arc::new(FakeLibrary {
        behavior: behavior.clone(),
    });
    (Arc::new(StaticLibraryLoader::new(library)), behavior)
}

impl QueryEngineLibrary for FakeLibrary {
    fn version(&self) -> Result<LibraryVersion, NativeError> {
        Ok(LibraryVersion {
            commit: COMMIT.to_string(),
            version: "5.0.0".to_string(),
        })
    }

    fn new_instance(
        &self,
        options: &InstanceOptions,
        logger: LogCallback,
    ) -> Result<Arc<dyn QueryEngineInstance>, NativeError> {
        *self.behavior.last_options.lock() = Some(options.clone());
        if let Some(error) = self.behavior.init_error.lock().take() {
            return Err(NativeError::new("GenericFailure", error.to_string()));
        }

        self.behavior.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeInstance {
            behavior: self.behavior.clone(),
            logger,
            transactions: Mutex::new(HashSet::new()),
            next_transaction: AtomicUsize::new(0),
        }))
    }

    fn get_config(&self, options: &Value) -> Result<String, NativeError> {
        let length = options
            .get("datamodel")
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or_default();
        Ok(json!({
            "datasources": [{ "name": "db", "provider": "sqlite" }],
            "generators": [],
            "warnings": [],
            "datamodelLength": length
        })
        .to_string())
    }

    fn dmmf(&self, datamodel: &str) -> Result<String, NativeError> {
        let models: Vec<Value> = datamodel
            .lines()
            .filter_map(|line| line.strip_prefix("model "))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(|name| json!({ "name": name }))
            .collect();
        Ok(json!({ "datamodel": { "models": models } }).to_string())
    }
}

struct FakeInstance {
    behavior: Arc<FakeBehavior>,
    logger: LogCallback,
    transactions: Mutex<HashSet<String>>,
    next_transaction: AtomicUsize,
}

fn answer(query: &str) -> Value {
    if query.contains("missing") {
        json!({
            "errors": [{
                "error": "Record to update not found.",
                "user_facing_error": {
                    "is_panic": false,
                    "message": "An operation failed because it depends on one or more records that were required but not found.",
                    "meta": { "cause": "Record to update not found." },
                    "error_code": "P2025"
                }
            }]
        })
    } else {
        json!({ "data": { "echo": query } })
    }
}

fn query_text(value: &Value) -> &str {
    value.get("query").and_then(Value::as_str).unwrap_or_default()
}

impl FakeInstance {
    fn log_query(&self, query: &str) {
        let line = json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "level": "INFO",
            "target": "quaint::connector::metrics",
            "item_type": "query",
            "fields": { "query": query, "params": "[]", "duration_ms": 2 }
        });
        (self.logger)(line.to_string());
    }

    fn finish_transaction(&self, args: &Value) -> String {
        let id = args.get("txId").and_then(Value::as_str).unwrap_or_default();
        if self.transactions.lock().remove(id) {
            "{}".to_string()
        } else {
            json!({
                "error_code": "P2028",
                "message": "Transaction API error: Transaction not found.",
                "meta": { "error": "Transaction not found." }
            })
            .to_string()
        }
    }
}

#[async_trait]
impl QueryEngineInstance for FakeInstance {
    async fn call(&self, method: NativeMethod, args: Value) -> Result<String, NativeError> {
        self.behavior.calls.lock().push((method, args.clone()));

        match method {
            NativeMethod::Connect => {
                self.behavior.connects.fetch_add(1, Ordering::SeqCst);
                if self.behavior.log_panic_on_connect.swap(false, Ordering::SeqCst) {
                    (self.logger)(PANIC_LINE.to_string());
                }
                Ok("{}".to_string())
            }
            NativeMethod::Disconnect => {
                self.behavior.disconnects.fetch_add(1, Ordering::SeqCst);
                Ok("{}".to_string())
            }
            NativeMethod::Query => {
                if self.behavior.panic_on_next_query.swap(false, Ordering::SeqCst) {
                    return Err(NativeError::new(
                        "GenericFailure",
                        "PANIC: index out of bounds: the len is 0 but the index is 0",
                    ));
                }
                let body = args.get("body").cloned().unwrap_or_default();
                let reply = match body.get("batch").and_then(Value::as_array) {
                    Some(batch) => {
                        let results: Vec<Value> =
                            batch.iter().map(|item| answer(query_text(item))).collect();
                        json!({ "batchResult": results })
                    }
                    None => {
                        self.log_query(query_text(&body));
                        answer(query_text(&body))
                    }
                };
                Ok(reply.to_string())
            }
            NativeMethod::StartTransaction => {
                let number = self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
                let id = format!("tx-{number}");
                self.transactions.lock().insert(id.clone());
                Ok(json!({ "id": id }).to_string())
            }
            NativeMethod::CommitTransaction | NativeMethod::RollbackTransaction => {
                Ok(self.finish_transaction(&args))
            }
            NativeMethod::Metrics => {
                let format = args
                    .pointer("/options/format")
                    .and_then(Value::as_str)
                    .unwrap_or("json");
                if format == "prometheus" {
                    Ok("prisma_client_queries_total 1\n".to_string())
                } else {
                    Ok(json!({
                        "counters": [{ "key": "prisma_client_queries_total", "labels": {}, "value": 1 }],
                        "gauges": [],
                        "histograms": []
                    })
                    .to_string())
                }
            }
        }
    }
}
