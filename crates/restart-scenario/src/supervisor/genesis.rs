use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::Genesis;

/// Generates the genesis JSON handed to every node via `--chain`.
pub fn generate_genesis_json(genesis: &Genesis) -> Value {
    let mut alloc = BTreeMap::new();
    for (address, balance) in &genesis.alloc {
        alloc.insert(format!("{address:?}"), json!({ "balance": format!("{balance:#x}") }));
    }

    json!({
        "config": {
            "chainId": genesis.chain_id,
            "homesteadBlock": 0,
            "eip150Block": 0,
            "eip155Block": 0,
            "eip158Block": 0,
            "byzantiumBlock": 0,
            "constantinopleBlock": 0,
            "petersburgBlock": 0,
            "istanbulBlock": 0,
            "berlinBlock": 0,
            "londonBlock": 0,
            "shanghaiTime": 0,
            "cancunTime": 0,
            "terminalTotalDifficulty": "0x0",
            "terminalTotalDifficultyPassed": true
        },
        "nonce": "0x0",
        "timestamp": "0x0",
        "extraData": "0x",
        "gasLimit": "0x1C9C380",
        "difficulty": "0x0",
        "mixHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
        "coinbase": "0x0000000000000000000000000000000000000000",
        "alloc": alloc,
        "number": "0x0",
        "gasUsed": "0x0",
        "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
        "baseFeePerGas": "0x3B9ACA00"
    })
}

/// Writes `genesis.json` into `dir` and returns its path.
pub fn write_genesis_file(dir: &Path, genesis: &Genesis) -> std::io::Result<PathBuf> {
    let value = generate_genesis_json(genesis);
    let path = dir.join("genesis.json");
    let text = serde_json::to_string_pretty(&value).map_err(std::io::Error::other)?;
    std::fs::write(&path, text)?;
    Ok(path)
}
