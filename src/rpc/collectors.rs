//! Gauges backed by JSON-RPC calls. One call per collector per scrape.

use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use serde_json::{Value, json};

use crate::{
    metrics::{Collector, Desc, Metric},
    rpc::{RpcClient, RpcError, parse_quantity},
};

/// A gauge whose value is the hex quantity returned by a single RPC method.
pub struct QuantityCollector {
    client: Arc<RpcClient>,
    desc: Arc<Desc>,
    method: &'static str,
    params: Value,
}

impl QuantityCollector {
    pub fn new(
        client: Arc<RpcClient>,
        name: &str,
        help: &str,
        method: &'static str,
        params: Value,
    ) -> Self {
        Self {
            client,
            desc: Desc::gauge(name, help, &[]),
            method,
            params,
        }
    }

    pub fn net_peer_count(client: Arc<RpcClient>) -> Self {
        Self::new(
            client,
            "net_peers",
            "The number of peers currently connected to the client",
            "net_peerCount",
            json!([]),
        )
    }

    pub fn block_number(client: Arc<RpcClient>) -> Self {
        Self::new(
            client,
            "eth_block_number",
            "The number of the most recent block",
            "eth_blockNumber",
            json!([]),
        )
    }

    pub fn gas_price(client: Arc<RpcClient>) -> Self {
        Self::new(
            client,
            "eth_gas_price",
            "The current price per gas in wei",
            "eth_gasPrice",
            json!([]),
        )
    }

    pub fn hashrate(client: Arc<RpcClient>) -> Self {
        Self::new(
            client,
            "eth_hashrate",
            "The number of hashes per second that the node is mining with",
            "eth_hashrate",
            json!([]),
        )
    }

    /// Transaction count of the `earliest`, `latest` or `pending` block.
    pub fn block_transactions(client: Arc<RpcClient>, block: &'static str) -> Self {
        Self::new(
            client,
            &format!("eth_{}_block_transactions", block),
            &format!("The number of transactions in the {} block", block),
            "eth_getBlockTransactionCountByNumber",
            json!([block]),
        )
    }
}

#[async_trait]
impl Collector for QuantityCollector {
    fn describe(&self) -> Vec<Arc<Desc>> {
        vec![Arc::clone(&self.desc)]
    }

    async fn collect(&self, out: &mut Vec<Metric>) {
        match self.client.quantity(self.method, self.params.clone()).await {
            Ok(value) => out.push(Metric::gauge(&self.desc, value, &[])),
            Err(err) => {
                debug!(target: "Rpc", "{} failed: {}", self.method, err);
                out.push(Metric::invalid(&self.desc, err));
            }
        }
    }
}

/// Timestamp of the latest block.
pub struct BlockTimestampCollector {
    client: Arc<RpcClient>,
    desc: Arc<Desc>,
}

impl BlockTimestampCollector {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            desc: Desc::gauge(
                "eth_block_timestamp",
                "The timestamp of the most recent block in seconds since epoch",
                &[],
            ),
        }
    }

    async fn timestamp(&self) -> Result<f64, RpcError> {
        let block = self
            .client
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        parse_quantity(&block["timestamp"])
    }
}

#[async_trait]
impl Collector for BlockTimestampCollector {
    fn describe(&self) -> Vec<Arc<Desc>> {
        vec![Arc::clone(&self.desc)]
    }

    async fn collect(&self, out: &mut Vec<Metric>) {
        match self.timestamp().await {
            Ok(value) => out.push(Metric::gauge(&self.desc, value, &[])),
            Err(err) => out.push(Metric::invalid(&self.desc, err)),
        }
    }
}

/// Sync progress from `eth_syncing`. A node that is not syncing reports
/// zero for all three gauges.
pub struct SyncingCollector {
    client: Arc<RpcClient>,
    starting: Arc<Desc>,
    current: Arc<Desc>,
    highest: Arc<Desc>,
}

impl SyncingCollector {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            starting: Desc::gauge("eth_sync_starting", "The block at which the import started", &[]),
            current: Desc::gauge("eth_sync_current", "The number of the most recent block", &[]),
            highest: Desc::gauge("eth_sync_highest", "The estimated highest block", &[]),
        }
    }

    async fn progress(&self) -> Result<[f64; 3], RpcError> {
        let status = self.client.call("eth_syncing", json!([])).await?;
        if status == Value::Bool(false) {
            return Ok([0.0; 3]);
        }
        Ok([
            parse_quantity(&status["startingBlock"])?,
            parse_quantity(&status["currentBlock"])?,
            parse_quantity(&status["highestBlock"])?,
        ])
    }
}

#[async_trait]
impl Collector for SyncingCollector {
    fn describe(&self) -> Vec<Arc<Desc>> {
        vec![
            Arc::clone(&self.starting),
            Arc::clone(&self.current),
            Arc::clone(&self.highest),
        ]
    }

    async fn collect(&self, out: &mut Vec<Metric>) {
        let descs = [&self.starting, &self.current, &self.highest];
        match self.progress().await {
            Ok(values) => {
                for (desc, value) in descs.into_iter().zip(values) {
                    out.push(Metric::gauge(desc, value, &[]));
                }
            }
            Err(err) => {
                let err = err.to_string();
                for desc in descs {
                    out.push(Metric::invalid(desc, &err));
                }
            }
        }
    }
}

/// Peer counts from the Parity/OpenEthereum `parity_netPeers` extension.
pub struct ParityNetPeersCollector {
    client: Arc<RpcClient>,
    active: Arc<Desc>,
    connected: Arc<Desc>,
}

impl ParityNetPeersCollector {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            active: Desc::gauge("parity_net_active_peers", "The number of active peers", &[]),
            connected: Desc::gauge(
                "parity_net_connected_peers",
                "The number of peers currently connected",
                &[],
            ),
        }
    }

    async fn peers(&self) -> Result<[f64; 2], RpcError> {
        let peers = self.client.call("parity_netPeers", json!([])).await?;
        Ok([
            parse_quantity(&peers["active"])?,
            parse_quantity(&peers["connected"])?,
        ])
    }
}

#[async_trait]
impl Collector for ParityNetPeersCollector {
    fn describe(&self) -> Vec<Arc<Desc>> {
        vec![Arc::clone(&self.active), Arc::clone(&self.connected)]
    }

    async fn collect(&self, out: &mut Vec<Metric>) {
        let descs = [&self.active, &self.connected];
        match self.peers().await {
            Ok(values) => {
                for (desc, value) in descs.into_iter().zip(values) {
                    out.push(Metric::gauge(desc, value, &[]));
                }
            }
            Err(err) => {
                let err = err.to_string();
                for desc in descs {
                    out.push(Metric::invalid(desc, &err));
                }
            }
        }
    }
}

/// Collectors for a plain EVM node: block height and time.
pub fn evm_collectors(client: &Arc<RpcClient>) -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(QuantityCollector::block_number(Arc::clone(client))),
        Box::new(BlockTimestampCollector::new(Arc::clone(client))),
    ]
}

/// Every RPC collector, for a full Ethereum node.
pub fn eth_collectors(client: &Arc<RpcClient>) -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(QuantityCollector::net_peer_count(Arc::clone(client))),
        Box::new(QuantityCollector::block_number(Arc::clone(client))),
        Box::new(BlockTimestampCollector::new(Arc::clone(client))),
        Box::new(QuantityCollector::gas_price(Arc::clone(client))),
        Box::new(QuantityCollector::block_transactions(Arc::clone(client), "earliest")),
        Box::new(QuantityCollector::block_transactions(Arc::clone(client), "latest")),
        Box::new(QuantityCollector::block_transactions(Arc::clone(client), "pending")),
        Box::new(QuantityCollector::hashrate(Arc::clone(client))),
        Box::new(SyncingCollector::new(Arc::clone(client))),
        Box::new(ParityNetPeersCollector::new(Arc::clone(client))),
    ]
}
