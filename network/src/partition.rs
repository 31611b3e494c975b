//! Network level addresses: partition four-tuples and node locations.

use core::fmt;

macro_rules! id_type {
    ($(#[$doc:meta] $name:ident,)*) => {
        $(
            #[$doc]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(u64);

            impl $name {
                pub const fn new(id: u64) -> Self {
                    $name(id)
                }

                pub const fn get(self) -> u64 {
                    self.0
                }
            }

            impl From<u64> for $name {
                fn from(id: u64) -> Self {
                    $name(id)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }
        )*
    };
}

id_type! {
    /// Identifier of a deployed query, unique across the cluster.
    QueryId,
    /// Identifier of one operator inside a query plan.
    OperatorId,
    /// Identifier of one partition of an operator's output stream.
    PartitionId,
    /// Identifier of one subpartition within a partition.
    SubpartitionId,
}

/// The wire address of a tuple stream fragment: unique and stable for the
/// lifetime of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    query_id: QueryId,
    operator_id: OperatorId,
    partition_id: PartitionId,
    subpartition_id: SubpartitionId,
}

impl Partition {
    pub const fn new(
        query_id: QueryId,
        operator_id: OperatorId,
        partition_id: PartitionId,
        subpartition_id: SubpartitionId,
    ) -> Self {
        Partition {
            query_id,
            operator_id,
            partition_id,
            subpartition_id,
        }
    }

    pub const fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub const fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    pub const fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub const fn subpartition_id(&self) -> SubpartitionId {
        self.subpartition_id
    }
}

impl From<(u64, u64, u64, u64)> for Partition {
    fn from((q, o, p, s): (u64, u64, u64, u64)) -> Self {
        Partition::new(q.into(), o.into(), p.into(), s.into())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}::{}",
            self.query_id, self.operator_id, self.partition_id, self.subpartition_id
        )
    }
}

/// Physical endpoint hosting one or more partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLocation {
    node_id: u64,
    host: String,
    data_port: u16,
}

impl NodeLocation {
    pub fn new(node_id: u64, host: impl Into<String>, data_port: u16) -> Self {
        NodeLocation {
            node_id,
            host: host.into(),
            data_port,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// `host:port` form accepted by the socket connectors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} @ {}:{}", self.node_id, self.host, self.data_port)
    }
}
