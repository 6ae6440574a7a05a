#![forbid(unsafe_code)]

//! Families of graphs keyed by classification id, then procedure.
//!
//! The two levels stay nested ordered maps so a saved artifact lists classification
//! ids in ascending order and diffs cleanly between training runs.

mod strategy;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::ProcedureCatalog;
use crate::graph::{GraphDocument, MarkovGraph};
use crate::types::{ClassificationId, MarkovError, PartitionId, ProcedureId, Result, TxnId};

pub use strategy::{BasePartition, ClassificationInput, ClassificationStrategy, ParameterBuckets};

/// Section name holding per-procedure feature keys.
pub const FEATURES_SECTION: &str = "FEATURES";
/// Section name holding the graphs.
pub const MARKOVS_SECTION: &str = "MARKOVS";

type GraphMap = BTreeMap<ClassificationId, BTreeMap<ProcedureId, Arc<MarkovGraph>>>;

/// Persisted form of a whole family.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FamilyDocument {
    /// Procedure key to ordered feature-key names.
    #[serde(rename = "FEATURES")]
    pub features: Option<BTreeMap<String, Vec<String>>>,
    /// Classification id to procedure key to graph.
    #[serde(rename = "MARKOVS")]
    pub markovs: Option<BTreeMap<i32, BTreeMap<String, GraphDocument>>>,
}

/// Ordered two-level collection of graphs plus per-procedure feature keys.
pub struct GraphFamily {
    markovs: RwLock<GraphMap>,
    features: RwLock<BTreeMap<ProcedureId, Vec<String>>>,
    bucketing: Arc<dyn ClassificationStrategy>,
}

impl Default for GraphFamily {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFamily")
            .field("classifications", &self.len())
            .field("graphs", &self.graph_count())
            .field("bucketing", &self.bucketing.name())
            .finish()
    }
}

impl GraphFamily {
    /// Creates an empty family whose feature-key path uses [`ParameterBuckets`].
    pub fn new() -> Self {
        Self::with_bucketing(Arc::new(ParameterBuckets))
    }

    /// Creates an empty family with a custom strategy for procedures that have
    /// registered feature keys.
    pub fn with_bucketing(bucketing: Arc<dyn ClassificationStrategy>) -> Self {
        Self {
            markovs: RwLock::new(BTreeMap::new()),
            features: RwLock::new(BTreeMap::new()),
            bucketing,
        }
    }

    /// Removes every graph and feature-key list.
    pub fn clear(&self) {
        self.install(BTreeMap::new(), BTreeMap::new());
    }

    /// Returns the graph for a classification id and procedure.
    pub fn get(&self, id: ClassificationId, procedure: ProcedureId) -> Option<Arc<MarkovGraph>> {
        self.markovs
            .read()
            .get(&id)
            .and_then(|inner| inner.get(&procedure))
            .cloned()
    }

    /// Returns the graph, creating an empty one (and the inner level) if absent.
    pub fn get_or_create(&self, id: ClassificationId, procedure: ProcedureId) -> Arc<MarkovGraph> {
        if let Some(graph) = self.get(id, procedure) {
            return graph;
        }
        let mut markovs = self.markovs.write();
        let inner = markovs.entry(id).or_default();
        Arc::clone(inner.entry(procedure).or_insert_with(|| {
            debug!(classification = %id, procedure = %procedure, "family.graph.create");
            Arc::new(MarkovGraph::new(procedure))
        }))
    }

    /// Installs a graph under its procedure for the given classification id.
    pub fn put(&self, id: ClassificationId, graph: Arc<MarkovGraph>) {
        self.markovs
            .write()
            .entry(id)
            .or_default()
            .insert(graph.procedure(), graph);
    }

    /// Chooses the classification id for an admitted transaction.
    ///
    /// Procedures without feature keys use their base partition. Procedures with
    /// feature keys defer to the bucketing strategy.
    pub fn classify(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        params: &[String],
        procedure: ProcedureId,
    ) -> Result<ClassificationId> {
        let features = self.features.read();
        let input = ClassificationInput {
            txn_id,
            base_partition,
            procedure,
            params,
            feature_keys: features.get(&procedure).map(Vec::as_slice).unwrap_or(&[]),
        };
        match features.get(&procedure) {
            None => BasePartition.classify(&input),
            Some(_) => self.bucketing.classify(&input),
        }
    }

    /// Resolves the graph for an admitted transaction, if one exists.
    pub fn get_from_params(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        params: &[String],
        procedure: ProcedureId,
    ) -> Result<Option<Arc<MarkovGraph>>> {
        let id = self.classify(txn_id, base_partition, params, procedure)?;
        Ok(self.get(id, procedure))
    }

    /// Appends feature-key names for a procedure.
    pub fn set_feature_keys<I, S>(&self, procedure: ProcedureId, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features
            .write()
            .entry(procedure)
            .or_default()
            .extend(keys.into_iter().map(Into::into));
    }

    /// Returns the registered feature keys for a procedure.
    pub fn get_feature_keys(&self, procedure: ProcedureId) -> Option<Vec<String>> {
        self.features.read().get(&procedure).cloned()
    }

    /// Every registered feature-key list, in procedure order.
    pub fn feature_keys(&self) -> Vec<(ProcedureId, Vec<String>)> {
        self.features
            .read()
            .iter()
            .map(|(procedure, keys)| (*procedure, keys.clone()))
            .collect()
    }

    /// Replaces this family's contents with another's, sharing its graphs.
    pub fn copy_from(&self, other: &GraphFamily) {
        if std::ptr::eq(self, other) {
            return;
        }
        let features = other.features.read().clone();
        let markovs = other.markovs.read().clone();
        self.install(features, markovs);
    }

    // Both guards are held across the swap, and the feature guard is released last,
    // so a reader that sees the new feature keys also sees the new graphs.
    fn install(&self, features: BTreeMap<ProcedureId, Vec<String>>, markovs: GraphMap) {
        let mut features_guard = self.features.write();
        let mut markovs_guard = self.markovs.write();
        *features_guard = features;
        *markovs_guard = markovs;
        drop(markovs_guard);
        drop(features_guard);
    }

    /// Number of classification ids.
    pub fn len(&self) -> usize {
        self.markovs.read().len()
    }

    /// Returns `true` if no graphs are held.
    pub fn is_empty(&self) -> bool {
        self.markovs.read().is_empty()
    }

    /// Number of graphs across all classification ids.
    pub fn graph_count(&self) -> usize {
        self.markovs.read().values().map(BTreeMap::len).sum()
    }

    /// Classification ids in ascending order.
    pub fn classification_ids(&self) -> Vec<ClassificationId> {
        self.markovs.read().keys().copied().collect()
    }

    /// Snapshot of every graph in classification-id, then procedure order.
    pub fn graphs(&self) -> Vec<(ClassificationId, Arc<MarkovGraph>)> {
        self.markovs
            .read()
            .iter()
            .flat_map(|(id, inner)| inner.values().map(move |g| (*id, Arc::clone(g))))
            .collect()
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Captures the family as a document with FEATURES and MARKOVS sections.
    pub fn to_document(&self, catalog: &dyn ProcedureCatalog) -> Result<FamilyDocument> {
        let procedure_key = |procedure: ProcedureId| {
            catalog
                .procedure_key(procedure)
                .map(str::to_string)
                .ok_or_else(|| MarkovError::unresolved("procedure", procedure.to_string()))
        };
        let mut features = BTreeMap::new();
        for (procedure, keys) in self.features.read().iter() {
            features.insert(procedure_key(*procedure)?, keys.clone());
        }
        let mut markovs = BTreeMap::new();
        for (id, inner) in self.markovs.read().iter() {
            debug!(classification = %id, graphs = inner.len(), "family.serialize");
            let mut docs = BTreeMap::new();
            for (procedure, graph) in inner {
                docs.insert(procedure_key(*procedure)?, graph.to_document(catalog)?);
            }
            markovs.insert(id.0, docs);
        }
        Ok(FamilyDocument {
            features: Some(features),
            markovs: Some(markovs),
        })
    }

    /// Builds a family from a document. Fails without side effects on any
    /// missing section, unresolved key or malformed graph.
    pub fn from_document(doc: &FamilyDocument, catalog: &dyn ProcedureCatalog) -> Result<Self> {
        let family = GraphFamily::new();
        family.install_document(doc, catalog)?;
        Ok(family)
    }

    fn install_document(&self, doc: &FamilyDocument, catalog: &dyn ProcedureCatalog) -> Result<()> {
        let features_doc = doc
            .features
            .as_ref()
            .ok_or(MarkovError::MissingSection(FEATURES_SECTION))?;
        let markovs_doc = doc
            .markovs
            .as_ref()
            .ok_or(MarkovError::MissingSection(MARKOVS_SECTION))?;
        let resolve = |key: &str| {
            catalog
                .resolve_procedure(key)
                .ok_or_else(|| MarkovError::unresolved("procedure", key))
        };

        let mut features = BTreeMap::new();
        for (key, names) in features_doc {
            features.insert(resolve(key)?, names.clone());
        }
        let mut markovs: GraphMap = BTreeMap::new();
        for (id, procs) in markovs_doc {
            let inner = markovs.entry(ClassificationId(*id)).or_default();
            for (key, graph_doc) in procs {
                let procedure = resolve(key)?;
                let graph = MarkovGraph::from_document(procedure, graph_doc, catalog)?;
                inner.insert(procedure, Arc::new(graph));
            }
        }
        self.install(features, markovs);
        Ok(())
    }

    /// Serializes the family to a JSON string.
    pub fn to_json_string(&self, catalog: &dyn ProcedureCatalog) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document(catalog)?)?)
    }

    /// Parses a family from a JSON string.
    pub fn from_json_str(input: &str, catalog: &dyn ProcedureCatalog) -> Result<Self> {
        let doc: FamilyDocument = serde_json::from_str(input)?;
        Self::from_document(&doc, catalog)
    }

    /// Writes the whole family to `path` in one pass.
    ///
    /// Output goes to a sibling temporary file that is renamed over `path` once
    /// fully written.
    pub fn save(&self, path: impl AsRef<Path>, catalog: &dyn ProcedureCatalog) -> Result<()> {
        let path = path.as_ref();
        let doc = self.to_document(catalog)?;
        let tmp = temp_path(path);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &doc)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!(
            path = %path.display(),
            classifications = self.len(),
            graphs = self.graph_count(),
            "family.save"
        );
        Ok(())
    }

    /// Loads a family from `path`.
    pub fn load(path: impl AsRef<Path>, catalog: &dyn ProcedureCatalog) -> Result<Self> {
        let family = GraphFamily::new();
        family.reload(path, catalog)?;
        Ok(family)
    }

    /// Replaces this family's contents with the artifact at `path`.
    ///
    /// On error the current contents are left untouched.
    pub fn reload(&self, path: impl AsRef<Path>, catalog: &dyn ProcedureCatalog) -> Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let doc: FamilyDocument = serde_json::from_str(&text)?;
        let staged = GraphFamily::new();
        staged.install_document(&doc, catalog)?;
        self.copy_from(&staged);
        info!(
            path = %path.display(),
            classifications = self.len(),
            graphs = self.graph_count(),
            "family.load"
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
