use crate::types::{ClassificationId, MarkovError, PartitionId, ProcedureId, Result, TxnId};

/// Inputs available when choosing which trained graph variant applies.
#[derive(Clone, Copy, Debug)]
pub struct ClassificationInput<'a> {
    /// Transaction being admitted.
    pub txn_id: TxnId,
    /// Home partition of the transaction.
    pub base_partition: PartitionId,
    /// Procedure invoked.
    pub procedure: ProcedureId,
    /// Invocation parameters, rendered as strings by the coordinator.
    pub params: &'a [String],
    /// Registered feature keys for the procedure; empty when none are registered.
    pub feature_keys: &'a [String],
}

/// Maps an admitted transaction to a classification id.
pub trait ClassificationStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Chooses the classification id for the transaction.
    fn classify(&self, input: &ClassificationInput<'_>) -> Result<ClassificationId>;
}

/// Uses the transaction's home partition as its classification id.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasePartition;

impl ClassificationStrategy for BasePartition {
    fn name(&self) -> &'static str {
        "base-partition"
    }

    fn classify(&self, input: &ClassificationInput<'_>) -> Result<ClassificationId> {
        ClassificationId::try_from(input.base_partition)
    }
}

/// Buckets transactions by the values of their registered feature-key parameters.
///
/// Declared so callers can wire it in, but the bucketing scheme itself is not
/// implemented; classification always reports [`MarkovError::Unsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ParameterBuckets;

impl ClassificationStrategy for ParameterBuckets {
    fn name(&self) -> &'static str {
        "parameter-buckets"
    }

    fn classify(&self, _input: &ClassificationInput<'_>) -> Result<ClassificationId> {
        Err(MarkovError::Unsupported(
            "classification by feature-key parameter buckets",
        ))
    }
}
