//! Flag monotonicity over Bitcoin Core's generated script assets and its
//! `tx_valid.json`/`tx_invalid.json` corpora.
//!
//! The fixtures are large and are not vendored. Point
//! `SCRIPT_ASSETS_TEST_JSON` at `script_assets_test.json` and
//! `TX_VECTORS_DIR` at the directory holding the tx vectors, or
//! `DIR_UNIT_TEST_DATA` at Core's `src/test/data` for all of them. Without
//! them the tests only report that they were skipped.


use bitcoin::hex::FromHex;
use script_asm::parse_script;
use script_consensus::{
    verify_input, Error, OutPoint, ScriptFlags, Secp256k1Backend, SighashCache, Transaction,
    TxOut, Witness, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_CLEANSTACK,
    VERIFY_DERSIG, VERIFY_DISCOURAGE_OP_SUCCESS, VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
    VERIFY_DISCOURAGE_UPGRADABLE_PUBKEYTYPE, VERIFY_DISCOURAGE_UPGRADABLE_TAPROOT_VERSION,
    VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM, VERIFY_LOW_S, VERIFY_MINIMALDATA,
    VERIFY_MINIMALIF, VERIFY_NULLDUMMY, VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_SIGPUSHONLY,
    VERIFY_STRICTENC, VERIFY_TAPROOT, VERIFY_WITNESS, VERIFY_WITNESS_PUBKEYTYPE,
};
use serde_json::Value;
use std::{env, fs, path::PathBuf};

const CONSENSUS_FLAGS_MASK: u32 = VERIFY_P2SH
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS
    | VERIFY_TAPROOT;

/// Core's `CONST_SCRIPTCODE` bit, which this crate does not implement.
const CONST_SCRIPTCODE: u32 = 1 << 16;

const FLAG_NAMES: &[(&str, u32)] = &[
    ("P2SH", VERIFY_P2SH),
    ("STRICTENC", VERIFY_STRICTENC),
    ("DERSIG", VERIFY_DERSIG),
    ("LOW_S", VERIFY_LOW_S),
    ("SIGPUSHONLY", VERIFY_SIGPUSHONLY),
    ("MINIMALDATA", VERIFY_MINIMALDATA),
    ("NULLDUMMY", VERIFY_NULLDUMMY),
    ("DISCOURAGE_UPGRADABLE_NOPS", VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
    ("CLEANSTACK", VERIFY_CLEANSTACK),
    ("MINIMALIF", VERIFY_MINIMALIF),
    ("NULLFAIL", VERIFY_NULLFAIL),
    ("CHECKLOCKTIMEVERIFY", VERIFY_CHECKLOCKTIMEVERIFY),
    ("CHECKSEQUENCEVERIFY", VERIFY_CHECKSEQUENCEVERIFY),
    ("WITNESS", VERIFY_WITNESS),
    ("DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM", VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM),
    ("WITNESS_PUBKEYTYPE", VERIFY_WITNESS_PUBKEYTYPE),
    ("CONST_SCRIPTCODE", CONST_SCRIPTCODE),
    ("TAPROOT", VERIFY_TAPROOT),
    ("DISCOURAGE_UPGRADABLE_PUBKEYTYPE", VERIFY_DISCOURAGE_UPGRADABLE_PUBKEYTYPE),
    ("DISCOURAGE_OP_SUCCESS", VERIFY_DISCOURAGE_OP_SUCCESS),
    ("DISCOURAGE_UPGRADABLE_TAPROOT_VERSION", VERIFY_DISCOURAGE_UPGRADABLE_TAPROOT_VERSION),
];

const ALL_TX_VECTOR_FLAGS: u32 = {
    let mut all = 0;
    let mut i = 0;
    while i < FLAG_NAMES.len() {
        all |= FLAG_NAMES[i].1;
        i += 1;
    }
    all
};

fn fixture(env_var: &str, file_name: &str) -> Option<PathBuf> {
    let path = env::var(env_var)
        .map(PathBuf::from)
        .or_else(|_| env::var("DIR_UNIT_TEST_DATA").map(|dir| PathBuf::from(dir).join(file_name)))
        .ok()?;
    path.exists().then_some(path)
}

fn load_json(path: &PathBuf) -> Value {
    let raw = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&raw)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

/// Every combination of the consensus flags that satisfies their
/// dependencies: WITNESS needs P2SH and TAPROOT needs WITNESS.
fn all_consensus_flags() -> Vec<u32> {
    let bits = [
        VERIFY_P2SH,
        VERIFY_DERSIG,
        VERIFY_NULLDUMMY,
        VERIFY_CHECKLOCKTIMEVERIFY,
        VERIFY_CHECKSEQUENCEVERIFY,
        VERIFY_WITNESS,
        VERIFY_TAPROOT,
    ];
    (0u32..1 << bits.len())
        .map(|mask| {
            bits.iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .fold(0, |acc, (_, bit)| acc | bit)
        })
        .filter(|flags| flags & VERIFY_WITNESS == 0 || flags & VERIFY_P2SH != 0)
        .filter(|flags| flags & VERIFY_TAPROOT == 0 || flags & VERIFY_WITNESS != 0)
        .collect()
}

/// Drops flags whose prerequisites are missing.
fn trim_flags(mut flags: u32) -> u32 {
    if flags & VERIFY_P2SH == 0 {
        flags &= !VERIFY_WITNESS;
    }
    if flags & VERIFY_WITNESS == 0 {
        flags &= !(VERIFY_CLEANSTACK | VERIFY_TAPROOT);
    }
    flags
}

/// Adds the prerequisites of every flag.
fn fill_flags(mut flags: u32) -> u32 {
    if flags & VERIFY_CLEANSTACK != 0 {
        flags |= VERIFY_WITNESS;
    }
    if flags & VERIFY_WITNESS != 0 {
        flags |= VERIFY_P2SH;
    }
    flags
}

enum TxVectorFlags {
    Parsed(u32),
    BadTx,
    Unknown(String),
}

fn parse_tx_vector_flags(raw: &str) -> TxVectorFlags {
    let mut bits = 0;
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token == "NONE" {
            continue;
        }
        if token == "BADTX" {
            return TxVectorFlags::BadTx;
        }
        match FLAG_NAMES.iter().find(|(name, _)| *name == token) {
            Some((_, bit)) => bits |= bit,
            None => return TxVectorFlags::Unknown(token.to_string()),
        }
    }
    TxVectorFlags::Parsed(bits)
}

fn hex_field(obj: &serde_json::Map<String, Value>, key: &str, case: usize) -> Vec<u8> {
    let raw = obj
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("case #{case} missing {key}"));
    Vec::from_hex(raw).unwrap_or_else(|_| panic!("case #{case} has invalid {key} hex"))
}

fn parse_witness(value: &Value) -> Witness {
    let items = value
        .as_array()
        .expect("witness must be an array")
        .iter()
        .map(|item| {
            Vec::from_hex(item.as_str().expect("witness items are hex strings"))
                .expect("witness item hex")
        })
        .collect::<Vec<_>>();
    Witness::from(items)
}

fn verify_case(
    tx: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    flags: u32,
) -> Result<(), Error> {
    let flags = ScriptFlags::from_bits(flags)?;
    let mut cache = SighashCache::new(tx);
    verify_input(&mut cache, &Secp256k1Backend::new(), input_index, prevouts, flags)
}

#[test]
fn consensus_flag_combinations_respect_dependencies() {
    let combos = all_consensus_flags();
    // 2^4 free bits times {none, P2SH, P2SH+WITNESS, P2SH+WITNESS+TAPROOT}.
    assert_eq!(combos.len(), 64);
    for flags in combos {
        assert_eq!(fill_flags(flags), flags);
        assert_eq!(trim_flags(flags), flags);
        ScriptFlags::from_bits(flags).expect("consensus flags are supported");
    }
}

#[test]
fn tx_vector_flag_names() {
    assert!(matches!(parse_tx_vector_flags("NONE"), TxVectorFlags::Parsed(0)));
    assert!(matches!(
        parse_tx_vector_flags("P2SH,WITNESS"),
        TxVectorFlags::Parsed(flags) if flags == VERIFY_P2SH | VERIFY_WITNESS
    ));
    assert!(matches!(parse_tx_vector_flags("P2SH,BADTX"), TxVectorFlags::BadTx));
    assert!(matches!(
        parse_tx_vector_flags("P2SH,NO_SUCH_FLAG"),
        TxVectorFlags::Unknown(token) if token == "NO_SUCH_FLAG"
    ));
}

/// Each asset carries a success and/or failure witness. Successes must hold
/// for every subset of the asset's flags (or for every flag set when the
/// asset is final), failures for every superset.
#[test]
fn script_assets_flag_monotonicity() {
    let Some(path) = fixture("SCRIPT_ASSETS_TEST_JSON", "script_assets_test.json") else {
        eprintln!("script_assets_test.json not available, skipping");
        return;
    };
    let tests = load_json(&path);
    let entries = tests.as_array().expect("top-level JSON must be an array");
    assert!(!entries.is_empty(), "script assets JSON is empty");

    let consensus_flags = all_consensus_flags();
    for (case, entry) in entries.iter().enumerate() {
        let obj = entry
            .as_object()
            .unwrap_or_else(|| panic!("case #{case} must be an object"));
        let mut tx = Transaction::deserialize(&hex_field(obj, "tx", case))
            .unwrap_or_else(|err| panic!("case #{case} tx: {err}"));
        let prevouts: Vec<TxOut> = obj
            .get("prevouts")
            .and_then(Value::as_array)
            .unwrap_or_else(|| panic!("case #{case} missing prevouts"))
            .iter()
            .map(|raw| {
                let bytes = Vec::from_hex(raw.as_str().expect("prevouts are hex strings"))
                    .expect("prevout hex");
                TxOut::deserialize(&bytes).expect("serialized prevout")
            })
            .collect();
        let input_index = obj
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| panic!("case #{case} missing index")) as usize;
        let test_flags = match parse_tx_vector_flags(
            obj.get("flags").and_then(Value::as_str).unwrap_or_default(),
        ) {
            TxVectorFlags::Parsed(flags) => flags,
            _ => panic!("case #{case} has unexpected flags"),
        };
        let is_final = obj.get("final").and_then(Value::as_bool).unwrap_or(false);

        if let Some(success) = obj.get("success").and_then(Value::as_object) {
            tx.input[input_index].script_sig = hex_field(success, "scriptSig", case);
            tx.input[input_index].witness = parse_witness(&success["witness"]);
            for &flags in &consensus_flags {
                if is_final || flags & test_flags == flags {
                    let result = verify_case(&tx, &prevouts, input_index, flags);
                    assert!(
                        result.is_ok(),
                        "case #{case} expected success with flags {flags:#x}, got {result:?}"
                    );
                }
            }
        }

        if let Some(failure) = obj.get("failure").and_then(Value::as_object) {
            tx.input[input_index].script_sig = hex_field(failure, "scriptSig", case);
            tx.input[input_index].witness = parse_witness(&failure["witness"]);
            for &flags in &consensus_flags {
                if flags & test_flags == test_flags {
                    assert!(
                        verify_case(&tx, &prevouts, input_index, flags).is_err(),
                        "case #{case} expected failure with flags {flags:#x}"
                    );
                }
            }
        }
    }
}

struct TxVector {
    tx: Transaction,
    prevouts: Vec<TxOut>,
    flags: u32,
}

/// Parses one `[[prevouts...], "tx hex", "flags"]` entry, mapping the
/// prevouts onto the inputs by outpoint. Returns `None` for comments and
/// for vectors this harness cannot express.
fn parse_tx_vector(entry: &Value) -> Option<TxVector> {
    let arr = entry.as_array()?;
    if arr.len() != 3 || !arr[0].is_array() {
        return None;
    }
    let flags = match parse_tx_vector_flags(arr[2].as_str()?) {
        TxVectorFlags::Parsed(flags) => flags,
        TxVectorFlags::BadTx => return None,
        TxVectorFlags::Unknown(token) => panic!("unknown tx vector flag {token}"),
    };
    let tx = Transaction::deserialize(&Vec::from_hex(arr[1].as_str()?).ok()?).ok()?;

    let mut known = Vec::new();
    for descriptor in arr[0].as_array()? {
        let fields = descriptor.as_array()?;
        let mut txid = <[u8; 32]>::from_hex(fields[0].as_str()?).ok()?;
        txid.reverse();
        let vout = fields[1].as_i64()? as u32;
        let script_pubkey = parse_script(fields[2].as_str()?)
            .unwrap_or_else(|err| panic!("prevout script: {err}"));
        let amount = fields.get(3).and_then(Value::as_u64).unwrap_or(0);
        known.push((OutPoint::new(txid, vout), TxOut::new(amount, script_pubkey)));
    }
    let prevouts = tx
        .input
        .iter()
        .map(|txin| {
            known
                .iter()
                .find(|(outpoint, _)| *outpoint == txin.previous_output)
                .map(|(_, txout)| txout.clone())
        })
        .collect::<Option<Vec<_>>>()?;

    Some(TxVector { tx, prevouts, flags })
}

fn tx_vectors(file_name: &str) -> Option<Vec<TxVector>> {
    let dir = env::var("TX_VECTORS_DIR")
        .or_else(|_| env::var("DIR_UNIT_TEST_DATA"))
        .ok()?;
    let path = PathBuf::from(dir).join(file_name);
    if !path.exists() {
        return None;
    }
    let json = load_json(&path);
    Some(json.as_array()?.iter().filter_map(parse_tx_vector).collect())
}

/// `tx_valid.json` lists the flags a vector is *excluded* from. Dropping
/// any consensus flag from the remaining set keeps every input valid.
#[test]
fn tx_valid_vectors_stay_valid_under_fewer_flags() {
    let Some(vectors) = tx_vectors("tx_valid.json") else {
        eprintln!("tx_valid.json not available, skipping");
        return;
    };
    let consensus_flags = all_consensus_flags();
    let mut checked = 0usize;

    for vector in &vectors {
        let included = ALL_TX_VECTOR_FLAGS & !vector.flags & !CONST_SCRIPTCODE;
        let fixed = included & !CONSENSUS_FLAGS_MASK;
        for &consensus in &consensus_flags {
            if consensus & included != consensus {
                continue;
            }
            let flags = trim_flags(fixed | consensus);
            for input_index in 0..vector.tx.input.len() {
                let result = verify_case(&vector.tx, &vector.prevouts, input_index, flags);
                assert!(
                    result.is_ok(),
                    "tx {} input {input_index} flags {flags:#x}: {result:?}",
                    hex(&vector.tx.txid())
                );
            }
            checked += 1;
        }
    }
    assert!(checked > 0, "no tx_valid vectors were checked");
}

/// `tx_invalid.json` lists the flags a vector needs to fail. Adding more
/// consensus flags keeps at least one input invalid.
#[test]
fn tx_invalid_vectors_stay_invalid_under_more_flags() {
    let Some(vectors) = tx_vectors("tx_invalid.json") else {
        eprintln!("tx_invalid.json not available, skipping");
        return;
    };
    let consensus_flags = all_consensus_flags();
    let mut checked = 0usize;

    for vector in &vectors {
        if vector.flags & CONST_SCRIPTCODE != 0 || fill_flags(vector.flags) != vector.flags {
            continue;
        }
        let fixed = vector.flags & !CONSENSUS_FLAGS_MASK;
        let required = vector.flags & CONSENSUS_FLAGS_MASK;
        for &consensus in &consensus_flags {
            if consensus & required != required {
                continue;
            }
            let flags = fill_flags(fixed | consensus);
            let any_failed = (0..vector.tx.input.len())
                .any(|input_index| verify_case(&vector.tx, &vector.prevouts, input_index, flags).is_err());
            assert!(
                any_failed,
                "tx {} unexpectedly valid with flags {flags:#x}",
                hex(&vector.tx.txid())
            );
            checked += 1;
        }
    }
    assert!(checked > 0, "no tx_invalid vectors were checked");
}

fn hex(txid: &[u8; 32]) -> String {
    txid.iter().rev().map(|b| format!("{b:02x}")).collect()
}
