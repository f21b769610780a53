mod common;

use bitgate_runtime::bitcoin_block::describe_script;
use bitgate_runtime::genesis::{
    chunk_file_name, export_utxos_chunked, import_utxos, load_genesis_from_file, read_utxo_record,
    write_utxo_record,
};
use bitgate_runtime::App;
use bitgate_state::ledger::{all_utxos, put_utxo};
use bitgate_state::{MemoryStore, Utxo};
use common::p2wpkh;
use std::io::Cursor;

fn sample(n: u32) -> Utxo {
    Utxo {
        txid: format!("{n:064x}"),
        vout: n % 3,
        amount: 1_000 + n as u64,
        entitled_amount: 1_000,
        script_pubkey: describe_script(&p2wpkh([n as u8; 20])),
    }
}

#[test]
fn framed_stream_round_trip() {
    let mut buf = Vec::new();
    for n in 0..3 {
        write_utxo_record(&mut buf, &sample(n)).unwrap();
    }
    let declared = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    assert_eq!(declared, bincode::serialize(&sample(0)).unwrap().len());

    let mut reader = Cursor::new(buf);
    let mut read = Vec::new();
    while let Some(utxo) = read_utxo_record(&mut reader).unwrap() {
        read.push(utxo);
    }
    assert_eq!(read, (0..3).map(sample).collect::<Vec<_>>());
}

#[test]
fn truncated_stream_is_an_error() {
    let mut buf = Vec::new();
    write_utxo_record(&mut buf, &sample(1)).unwrap();
    buf.truncate(buf.len() - 2);
    assert!(read_utxo_record(&mut Cursor::new(buf)).is_err());
}

#[test]
fn chunked_export_then_import() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = MemoryStore::new();
    for n in 0..7 {
        put_utxo(&mut source, &sample(n)).unwrap();
    }
    let files = export_utxos_chunked(&source, dir.path(), 3).unwrap();
    assert_eq!(files.len(), 3);
    assert_eq!(files[0].file_name().unwrap().to_str().unwrap(), chunk_file_name(0));
    assert_eq!(chunk_file_name(12), "utxos-00012.bin");

    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
    let mut target = MemoryStore::new();
    assert_eq!(import_utxos(&mut target, dir.path()).unwrap(), 7);
    assert_eq!(all_utxos(&target).unwrap(), all_utxos(&source).unwrap());
    assert_eq!(target.root(), source.root());
}

#[test]
fn genesis_json_loads() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("genesis.json");
    let operator = "11".repeat(32);
    let pubkey = "22".repeat(32);
    std::fs::write(
        &path,
        format!(
            r#"{{
                "params": {{
                    "authority": "{operator}",
                    "bond_denom": "ubgt",
                    "zk_entropy_threshold": 1,
                    "zk_entropy_window": 50,
                    "chain_id": "bitgate-test"
                }},
                "validators": [{{"operator": "{operator}", "pubkey": "{pubkey}", "power": 10}}],
                "last_processed_height": 812000
            }}"#
        ),
    )?;
    let genesis = load_genesis_from_file(&path)?;
    let app = App::from_genesis(&genesis)?;
    assert_eq!(app.params()?.chain_id, "bitgate-test");
    assert_eq!(app.validators().len(), 1);
    assert!(app.validators()[0].is_bonded());
    assert_eq!(app.last_processed_height()?, 812_000);
    Ok(())
}
