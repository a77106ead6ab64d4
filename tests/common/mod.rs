pub(crate) mod logging;

pub(crate) mod mem_chain;

pub(crate) mod network;

pub(crate) mod node;

pub(crate) mod tx_pool;
