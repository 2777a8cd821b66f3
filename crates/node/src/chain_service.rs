//! Chain service RPC: the request/response protocol peers use to fetch
//! blocks, txid lists, and individual block transactions from us, and the
//! client side we use to repair compact-block decodes and satisfy
//! consensus block requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use umbrad_consensus::Hash256;
use umbrad_primitives::block::Block;
use umbrad_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbrad_primitives::transaction::Transaction;

use crate::p2p::FramedStream;
use crate::peer_book::PeerBook;

/// Behavioral penalty for a peer that answers a GetBlockTxs request with
/// the wrong number of transactions.
pub const BANSCORE_INCOMPLETE_TXS: u32 = 50;

const TAG_GET_BLOCK: u8 = 0;
const TAG_GET_BLOCK_TXIDS: u8 = 1;
const TAG_GET_BLOCK_TXS: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainServiceRequest {
    GetBlock {
        block_id: Hash256,
    },
    GetBlockTxids {
        block_id: Hash256,
    },
    GetBlockTxs {
        block_id: Hash256,
        tx_indexes: Vec<u32>,
    },
}

impl ChainServiceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            ChainServiceRequest::GetBlock { block_id } => {
                encoder.write_u8(TAG_GET_BLOCK);
                encoder.write_hash(block_id);
            }
            ChainServiceRequest::GetBlockTxids { block_id } => {
                encoder.write_u8(TAG_GET_BLOCK_TXIDS);
                encoder.write_hash(block_id);
            }
            ChainServiceRequest::GetBlockTxs {
                block_id,
                tx_indexes,
            } => {
                encoder.write_u8(TAG_GET_BLOCK_TXS);
                encoder.write_hash(block_id);
                encoder.write_varint(tx_indexes.len() as u64);
                for index in tx_indexes {
                    encoder.write_u32_le(*index);
                }
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.read_u8()?;
        let request = match tag {
            TAG_GET_BLOCK => ChainServiceRequest::GetBlock {
                block_id: decoder.read_hash()?,
            },
            TAG_GET_BLOCK_TXIDS => ChainServiceRequest::GetBlockTxids {
                block_id: decoder.read_hash()?,
            },
            TAG_GET_BLOCK_TXS => {
                let block_id = decoder.read_hash()?;
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut tx_indexes = Vec::with_capacity(count);
                for _ in 0..count {
                    tx_indexes.push(decoder.read_u32_le()?);
                }
                ChainServiceRequest::GetBlockTxs {
                    block_id,
                    tx_indexes,
                }
            }
            _ => return Err(DecodeError::InvalidData("unknown chain service request tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(request)
    }
}

/// Stable wire error enum. Changing any value is a protocol break.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseError {
    None = 0,
    NotFound = 1,
    BadRequest = 2,
}

impl ResponseError {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ResponseError::None),
            1 => Ok(ResponseError::NotFound),
            2 => Ok(ResponseError::BadRequest),
            _ => Err(DecodeError::InvalidData("unknown response error value")),
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseError::None => write!(f, "none"),
            ResponseError::NotFound => write!(f, "not found"),
            ResponseError::BadRequest => write!(f, "bad request"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockResponse {
    pub error: ResponseError,
    pub block: Option<Block>,
}

impl BlockResponse {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(self.error as u8);
        if let Some(block) = &self.block {
            encoder.write_bytes(&block.consensus_encode());
        }
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let error = ResponseError::from_u8(decoder.read_u8()?)?;
        let block = if error == ResponseError::None {
            Some(Block::decode_from(&mut decoder)?)
        } else {
            None
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { error, block })
    }
}

#[derive(Clone, Debug)]
pub struct BlockTxidsResponse {
    pub error: ResponseError,
    pub txids: Vec<Hash256>,
}

impl BlockTxidsResponse {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(self.error as u8);
        if self.error == ResponseError::None {
            encoder.write_varint(self.txids.len() as u64);
            for txid in &self.txids {
                encoder.write_hash(txid);
            }
        }
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let error = ResponseError::from_u8(decoder.read_u8()?)?;
        let mut txids = Vec::new();
        if error == ResponseError::None {
            let count = decoder.read_varint()?;
            let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
            txids.reserve(count);
            for _ in 0..count {
                txids.push(decoder.read_hash()?);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { error, txids })
    }
}

#[derive(Clone, Debug)]
pub struct BlockTxsResponse {
    pub error: ResponseError,
    pub transactions: Vec<Transaction>,
}

impl BlockTxsResponse {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(self.error as u8);
        if self.error == ResponseError::None {
            encoder.write_varint(self.transactions.len() as u64);
            for tx in &self.transactions {
                tx.consensus_encode(&mut encoder);
            }
        }
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let error = ResponseError::from_u8(decoder.read_u8()?)?;
        let mut transactions = Vec::new();
        if error == ResponseError::None {
            let count = decoder.read_varint()?;
            let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
            transactions.reserve(count);
            for _ in 0..count {
                transactions.push(Transaction::consensus_decode(&mut decoder)?);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            error,
            transactions,
        })
    }
}

/// Lookup the server answers requests from. Must see blocks sitting in
/// the consensus engine's active inventory as well as connected blocks,
/// since peers decode our announcements before anything finalizes.
pub type BlockFetcher = Arc<dyn Fn(&Hash256) -> Option<Block> + Send + Sync>;

pub struct ChainService {
    fetch_block: BlockFetcher,
}

impl ChainService {
    pub fn new(fetch_block: BlockFetcher) -> Self {
        Self { fetch_block }
    }

    /// Serve a single peer stream: read, handle, respond, loop. Requests
    /// are strictly sequential per stream. Returning an error drops the
    /// stream.
    pub async fn handle_stream(
        &self,
        stream: &mut FramedStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        let mut shutdown = shutdown;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let frame = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                frame = stream.read_frame() => frame?,
            };
            let request =
                ChainServiceRequest::decode(&frame).map_err(|err| err.to_string())?;
            let response = self.handle_request(&request);
            stream.write_frame(&response).await?;
        }
    }

    fn handle_request(&self, request: &ChainServiceRequest) -> Vec<u8> {
        match request {
            ChainServiceRequest::GetBlock { block_id } => match (self.fetch_block)(block_id) {
                Some(block) => BlockResponse {
                    error: ResponseError::None,
                    block: Some(block),
                }
                .encode(),
                None => BlockResponse {
                    error: ResponseError::NotFound,
                    block: None,
                }
                .encode(),
            },
            ChainServiceRequest::GetBlockTxids { block_id } => {
                match (self.fetch_block)(block_id) {
                    Some(block) => BlockTxidsResponse {
                        error: ResponseError::None,
                        txids: block.txids(),
                    }
                    .encode(),
                    None => BlockTxidsResponse {
                        error: ResponseError::NotFound,
                        txids: Vec::new(),
                    }
                    .encode(),
                }
            }
            ChainServiceRequest::GetBlockTxs {
                block_id,
                tx_indexes,
            } => match (self.fetch_block)(block_id) {
                Some(block) => {
                    // Positions are preserved: response slot i answers
                    // request index i, and nothing is silently dropped.
                    let mut transactions = Vec::with_capacity(tx_indexes.len());
                    for index in tx_indexes {
                        match block.transactions.get(*index as usize) {
                            Some(tx) => transactions.push(tx.clone()),
                            None => {
                                return BlockTxsResponse {
                                    error: ResponseError::BadRequest,
                                    transactions: Vec::new(),
                                }
                                .encode()
                            }
                        }
                    }
                    BlockTxsResponse {
                        error: ResponseError::None,
                        transactions,
                    }
                    .encode()
                }
                None => BlockTxsResponse {
                    error: ResponseError::NotFound,
                    transactions: Vec::new(),
                }
                .encode(),
            },
        }
    }
}

/// Client side. One cached stream per peer; calls to the same peer are
/// serialized on that stream, calls to different peers proceed in
/// parallel. Any transport fault drops the cached stream so the next
/// call redials.
pub struct ChainServiceClient {
    protocol: String,
    peer_book: Arc<PeerBook>,
    streams: Mutex<HashMap<SocketAddr, Arc<tokio::sync::Mutex<FramedStream>>>>,
    shutdown: watch::Receiver<bool>,
}

impl ChainServiceClient {
    pub fn new(
        protocol: String,
        peer_book: Arc<PeerBook>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            protocol,
            peer_book,
            streams: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub async fn get_block(&self, peer: SocketAddr, block_id: Hash256) -> Result<Block, String> {
        let request = ChainServiceRequest::GetBlock { block_id };
        let response = self.call(peer, &request).await?;
        let response = BlockResponse::decode(&response).map_err(|err| err.to_string())?;
        if response.error != ResponseError::None {
            return Err(format!("error response from peer: {}", response.error));
        }
        response
            .block
            .ok_or_else(|| "peer sent empty block response".to_string())
    }

    pub async fn get_block_txids(
        &self,
        peer: SocketAddr,
        block_id: Hash256,
    ) -> Result<Vec<Hash256>, String> {
        let request = ChainServiceRequest::GetBlockTxids { block_id };
        let response = self.call(peer, &request).await?;
        let response = BlockTxidsResponse::decode(&response).map_err(|err| err.to_string())?;
        if response.error != ResponseError::None {
            return Err(format!("error response from peer: {}", response.error));
        }
        Ok(response.txids)
    }

    pub async fn get_block_txs(
        &self,
        peer: SocketAddr,
        block_id: Hash256,
        tx_indexes: &[u32],
    ) -> Result<Vec<Transaction>, String> {
        let request = ChainServiceRequest::GetBlockTxs {
            block_id,
            tx_indexes: tx_indexes.to_vec(),
        };
        let response = self.call(peer, &request).await?;
        let response = BlockTxsResponse::decode(&response).map_err(|err| err.to_string())?;
        if response.error != ResponseError::None {
            return Err(format!("error response from peer: {}", response.error));
        }
        if response.transactions.len() != tx_indexes.len() {
            self.peer_book
                .increase_banscore(peer, BANSCORE_INCOMPLETE_TXS, 0);
            return Err(format!("peer {peer} did not return all requested txs"));
        }
        Ok(response.transactions)
    }

    async fn call(&self, peer: SocketAddr, request: &ChainServiceRequest) -> Result<Vec<u8>, String> {
        if *self.shutdown.borrow() {
            return Err("shutting down".to_string());
        }

        let slot = {
            let streams = self.streams.lock().expect("client stream lock");
            streams.get(&peer).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let stream = FramedStream::connect(peer, &self.protocol).await?;
                let slot = Arc::new(tokio::sync::Mutex::new(stream));
                let mut streams = self.streams.lock().expect("client stream lock");
                streams.entry(peer).or_insert_with(|| slot.clone()).clone()
            }
        };

        let result = {
            let mut stream = slot.lock().await;
            self.call_on_stream(&mut stream, request).await
        };
        if result.is_err() {
            let mut streams = self.streams.lock().expect("client stream lock");
            streams.remove(&peer);
        }
        result
    }

    async fn call_on_stream(
        &self,
        stream: &mut FramedStream,
        request: &ChainServiceRequest,
    ) -> Result<Vec<u8>, String> {
        stream.write_frame(&request.encode()).await?;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => Err("shutting down".to_string()),
            frame = stream.read_frame() => frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use umbrad_consensus::Policy;
    use umbrad_primitives::block::{merkle_root, BlockHeader, CURRENT_VERSION};
    use umbrad_primitives::transaction::{Output, StandardTransaction};

    const TEST_PROTOCOL: &str = "/umbra/regtest/chainservice";

    fn tx(tag: u8) -> Transaction {
        Transaction::Standard(StandardTransaction {
            outputs: vec![Output {
                commitment: [tag; 32],
                ciphertext: vec![tag; 16],
            }],
            nullifiers: vec![[tag; 32]],
            txo_root: [0u8; 32],
            locktime: 0,
            fee: 10,
            proof: Vec::new(),
        })
    }

    fn sample_block() -> Block {
        let transactions = vec![tx(1), tx(2), tx(3), tx(4)];
        let tx_root = merkle_root(
            &transactions
                .iter()
                .map(|tx| tx.txid())
                .collect::<Vec<_>>(),
        );
        Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                height: 7,
                parent: [7u8; 32],
                timestamp: 1_700_000_000,
                tx_root,
                producer_id: vec![0xaa],
                signature: vec![0xbb],
            },
            transactions,
        }
    }

    async fn spawn_server(block: Block) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let block_id = block.block_id();
        let fetcher: BlockFetcher = Arc::new(move |id: &Hash256| {
            if *id == block_id {
                Some(block.clone())
            } else {
                None
            }
        });
        let service = Arc::new(ChainService::new(fetcher));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let service = service.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    let mut framed = FramedStream::new(stream);
                    let Ok(protocol) = framed.read_protocol().await else {
                        return;
                    };
                    if protocol != TEST_PROTOCOL {
                        return;
                    }
                    let _ = service.handle_stream(&mut framed, shutdown).await;
                });
            }
        });
        (addr, shutdown_tx)
    }

    fn new_client() -> (ChainServiceClient, Arc<PeerBook>, watch::Sender<bool>) {
        let peer_book = Arc::new(PeerBook::new(&Policy::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client =
            ChainServiceClient::new(TEST_PROTOCOL.to_string(), peer_book.clone(), shutdown_rx);
        (client, peer_book, shutdown_tx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_blocks_txids_and_txs() {
        let block = sample_block();
        let block_id = block.block_id();
        let (addr, _server_shutdown) = spawn_server(block.clone()).await;
        let (client, peer_book, _shutdown) = new_client();

        let fetched = client.get_block(addr, block_id).await.expect("get block");
        assert_eq!(fetched, block);

        let txids = client
            .get_block_txids(addr, block_id)
            .await
            .expect("get txids");
        assert_eq!(txids, block.txids());

        // Positions are preserved relative to the request ordering.
        let txs = client
            .get_block_txs(addr, block_id, &[3, 0])
            .await
            .expect("get txs");
        assert_eq!(txs[0], block.transactions[3]);
        assert_eq!(txs[1], block.transactions[0]);

        assert_eq!(peer_book.banscore(addr), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_block_is_not_found() {
        let block = sample_block();
        let (addr, _server_shutdown) = spawn_server(block).await;
        let (client, _peer_book, _shutdown) = new_client();

        let err = client
            .get_block(addr, [0xee; 32])
            .await
            .expect_err("unknown block");
        assert!(err.contains("not found"), "unexpected error: {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_range_index_is_bad_request() {
        let block = sample_block();
        let block_id = block.block_id();
        let (addr, _server_shutdown) = spawn_server(block).await;
        let (client, peer_book, _shutdown) = new_client();

        let err = client
            .get_block_txs(addr, block_id, &[0, 99])
            .await
            .expect_err("index out of range");
        assert!(err.contains("bad request"), "unexpected error: {err}");
        // An honest error response is not an incomplete tx list.
        assert_eq!(peer_book.banscore(addr), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn short_tx_response_scores_the_peer() {
        // A lying server that answers any GetBlockTxs with a single tx.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut framed = FramedStream::new(stream);
            let _ = framed.read_protocol().await;
            let _ = framed.read_frame().await;
            let response = BlockTxsResponse {
                error: ResponseError::None,
                transactions: vec![tx(9)],
            };
            let _ = framed.write_frame(&response.encode()).await;
        });

        let (client, peer_book, _shutdown) = new_client();
        let err = client
            .get_block_txs(addr, [1u8; 32], &[0, 1, 2])
            .await
            .expect_err("short response");
        assert!(err.contains("did not return all requested txs"));
        assert_eq!(peer_book.banscore(addr).0, BANSCORE_INCOMPLETE_TXS);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_abort_after_shutdown() {
        let block = sample_block();
        let (addr, _server_shutdown) = spawn_server(block).await;
        let (client, _peer_book, shutdown) = new_client();
        shutdown.send(true).expect("signal shutdown");
        let err = client
            .get_block(addr, [0u8; 32])
            .await
            .expect_err("cancelled");
        assert!(err.contains("shutting down"));
    }
}
