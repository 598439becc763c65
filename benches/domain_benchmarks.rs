use criterion::{Criterion, criterion_group, criterion_main};
use oxide_settlement::domain::{Amount, NodeWebhook, TransactionStatus};
use rust_decimal_macros::dec;
use std::hint::black_box;
use std::str::FromStr;

fn bench_amount_arithmetic(c: &mut Criterion) {
    let balance = Amount::crypto("ETH", dec!(1.25), 18).unwrap();
    let fee = Amount::crypto("ETH", dec!(0.000021), 18).unwrap();

    c.bench_function("amount_checked_add", |b| {
        b.iter(|| black_box(&balance).checked_add(black_box(&fee)).unwrap())
    });

    c.bench_function("amount_to_raw_string", |b| {
        b.iter(|| black_box(&balance).to_raw_string())
    });

    c.bench_function("amount_from_raw", |b| {
        b.iter(|| Amount::from_raw("ETH", black_box("1250000000000000000"), 18).unwrap())
    });
}

fn bench_webhook_parsing(c: &mut Criterion) {
    let payload = r#"{
        "subscriptionType": "ADDRESS_EVENT",
        "txId": "0x7a1df3a6c9b04f4e8a2d5320b7f0381be1e0f6a1e9c42d7b8a35196370a3c8d1",
        "address": "0xdeposit",
        "counterAddress": "0xcounterparty",
        "asset": "ETH",
        "amount": "0.533",
        "chain": "ethereum-mainnet",
        "type": "native",
        "mempool": false,
        "blockNumber": 19000000
    }"#;

    c.bench_function("parse_deposit_webhook", |b| {
        b.iter(|| serde_json::from_str::<NodeWebhook>(black_box(payload)).unwrap())
    });
}

fn bench_status_parsing(c: &mut Criterion) {
    c.bench_function("parse_transaction_status", |b| {
        b.iter(|| TransactionStatus::from_str(black_box("inProgressInv")).unwrap())
    });
}

criterion_group!(
    benches,
    bench_amount_arithmetic,
    bench_webhook_parsing,
    bench_status_parsing
);
criterion_main!(benches);
