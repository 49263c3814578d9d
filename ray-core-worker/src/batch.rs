// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Batch inference over shards: an in-memory table, the shard reader and
//! model contracts, and a pool actor that loads a model once and applies it
//! to every shard it is given.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actor_pool::{ActorError, PoolActor};
use crate::error::{CoreWorkerError, CoreWorkerResult};

/// A columnar table of numeric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    columns: BTreeMap<String, Vec<f64>>,
    num_rows: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column. Every column must have the same length.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> CoreWorkerResult<Self> {
        let name = name.into();
        if !self.columns.is_empty() && values.len() != self.num_rows {
            return Err(CoreWorkerError::InvalidArgument(format!(
                "column {name} has {} rows, batch has {}",
                values.len(),
                self.num_rows
            )));
        }
        self.num_rows = values.len();
        self.columns.insert(name, values);
        Ok(self)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

pub trait ShardReader: Send + Sync {
    fn read_shard(&self, path: &Path) -> CoreWorkerResult<Batch>;
}

/// Reads shards stored as JSON lines, one object of numeric fields per row.
/// Every row must carry the same fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesShardReader;

impl ShardReader for JsonLinesShardReader {
    fn read_shard(&self, path: &Path) -> CoreWorkerResult<Batch> {
        let file = std::fs::File::open(path).map_err(|err| {
            CoreWorkerError::InvalidArgument(format!("cannot open shard {}: {err}", path.display()))
        })?;
        let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut num_rows = 0usize;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                CoreWorkerError::InvalidArgument(format!("reading {}: {err}", path.display()))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row: BTreeMap<String, f64> = serde_json::from_str(&line).map_err(|err| {
                CoreWorkerError::Serialization(format!(
                    "{}:{}: {err}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            if num_rows > 0 && !row.keys().eq(columns.keys()) {
                return Err(CoreWorkerError::InvalidArgument(format!(
                    "{}:{}: row fields differ from the first row",
                    path.display(),
                    line_no + 1
                )));
            }
            for (name, value) in row {
                columns.entry(name).or_default().push(value);
            }
            num_rows += 1;
        }
        tracing::debug!(path = %path.display(), num_rows, "Shard read");
        Ok(Batch { columns, num_rows })
    }
}

/// A pure function from batch to batch, loaded once and applied many times.
pub trait Model: Send + Sync {
    fn apply(&self, batch: Batch) -> Result<Batch, String>;
}

/// Pool actor for batch inference: reads the shard at the given path and
/// runs the model over it.
pub struct BatchInferenceActor {
    reader: Arc<dyn ShardReader>,
    model: Box<dyn Model>,
    batches_processed: u64,
}

impl BatchInferenceActor {
    pub fn new(reader: Arc<dyn ShardReader>, model: Box<dyn Model>) -> Self {
        Self {
            reader,
            model,
            batches_processed: 0,
        }
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed
    }
}

#[async_trait::async_trait]
impl PoolActor for BatchInferenceActor {
    type Input = PathBuf;
    type Output = Batch;

    async fn call(&mut self, path: PathBuf) -> Result<Batch, ActorError> {
        // Shard reads do file IO; keep them off the runtime's worker threads.
        let reader = self.reader.clone();
        let batch = tokio::task::spawn_blocking(move || reader.read_shard(&path))
            .await
            .map_err(|err| ActorError::Application(format!("shard read aborted: {err}")))?
            .map_err(|err| ActorError::Application(err.to_string()))?;
        let output = self.model.apply(batch).map_err(ActorError::Application)?;
        self.batches_processed += 1;
        Ok(output)
    }
}
