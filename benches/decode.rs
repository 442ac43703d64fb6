//! Benchmark: decode vs decode+encode of a block of M-Bus long frames, and decode of a
//! single Modbus PDU through the switch dispatch path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use wiremodel::{
    ArrayLength, ByteOrder, Case, CaseValue, ChecksumAlgorithm, Codec, ComplexTypeDefinition, Expr, Field, Parameter,
    SimpleTypeReference, TypeRegistry, Value,
};

const MBUS_FRAME: [u8; 37] = [
    0x68, 0x1F, 0x1F, 0x68, 0x08, 0x02, 0x72, 0x78, 0x56, 0x34, 0x12, 0x24, 0x40, 0x01, 0x07, 0x55, 0x00, 0x00, 0x00,
    0x03, 0x13, 0x15, 0x31, 0x00, 0xDA, 0x02, 0x3B, 0x13, 0x01, 0x8B, 0x60, 0x04, 0x37, 0x18, 0x02, 0x18, 0x16,
];

fn build_codec() -> Codec {
    let u8t = || SimpleTypeReference::uint(8);
    let mut registry = TypeRegistry::new();
    registry.declare(ComplexTypeDefinition::new(
        "MBusLongFrame",
        vec![
            Field::constant("start", u8t(), 0x68u64),
            Field::simple("length", u8t()),
            Field::simple("lengthRepeat", u8t()),
            Field::constant("startRepeat", u8t(), 0x68u64),
            Field::simple("control", u8t()),
            Field::simple("address", u8t()),
            Field::simple("controlInformation", u8t()),
            Field::array(
                "data",
                SimpleTypeReference::byte(),
                ArrayLength::LengthInBytes(Expr::var("length").sub(Expr::uint(3))),
            ),
            Field::checksum("checksum", u8t(), ChecksumAlgorithm::Sum8, 4),
            Field::constant("stop", u8t(), 0x16u64),
        ],
    ));
    registry.declare(
        ComplexTypeDefinition::new(
            "ModbusPDU",
            vec![
                Field::discriminator("errorFlag", SimpleTypeReference::bit()),
                Field::discriminator("functionFlag", SimpleTypeReference::uint(7)),
                Field::switch(
                    &["errorFlag", "functionFlag", "response"],
                    vec![
                        Case::new(
                            "ModbusPDUError",
                            vec![true.into(), CaseValue::Any, CaseValue::Any],
                            vec![Field::simple("exceptionCode", u8t())],
                        ),
                        Case::new(
                            "ModbusPDUReadHoldingRegistersResponse",
                            vec![false.into(), 0x03u64.into(), true.into()],
                            vec![
                                Field::implicit("byteCount", u8t(), Expr::count("value")),
                                Field::array("value", SimpleTypeReference::byte(), ArrayLength::Count(Expr::var("byteCount"))),
                            ],
                        ),
                    ],
                ),
            ],
        )
        .with_params(vec![Parameter::new("response", SimpleTypeReference::bit())]),
    );
    Codec::new(Arc::new(registry.resolve()), ByteOrder::BigEndian).expect("valid schema")
}

/// Decode one block: repeatedly decode_with_extent until consumed or no progress.
fn decode_block(body: &[u8], codec: &Codec) -> usize {
    let mut offset = 0usize;
    let mut records = 0usize;
    while offset < body.len() {
        let (consumed, result) = codec.decode_with_extent("MBusLongFrame", &body[offset..]);
        if consumed == 0 || result.is_err() {
            break;
        }
        offset += consumed;
        records += 1;
    }
    records
}

/// Decode then encode each record (round-trip). Same record count as decode.
fn decode_encode_block(body: &[u8], codec: &Codec) -> usize {
    let mut offset = 0usize;
    let mut records = 0usize;
    while offset < body.len() {
        let (consumed, result) = codec.decode_with_extent("MBusLongFrame", &body[offset..]);
        let Ok(value) = result else { break };
        if consumed == 0 {
            break;
        }
        if codec.encode("MBusLongFrame", &value).is_ok() {
            records += 1;
        }
        offset += consumed;
    }
    records
}

fn bench_decode(c: &mut Criterion) {
    let codec = build_codec();
    let block: Vec<u8> = MBUS_FRAME.iter().copied().cycle().take(MBUS_FRAME.len() * 64).collect();
    assert_eq!(decode_block(&block, &codec), 64);

    c.bench_function("decode_mbus_block", |b| {
        b.iter(|| black_box(decode_block(black_box(&block), &codec)));
    });

    c.bench_function("decode_encode_mbus_block", |b| {
        b.iter(|| black_box(decode_encode_block(black_box(&block), &codec)));
    });

    let pdu = [0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
    let args = [Value::Bool(true)];
    c.bench_function("decode_modbus_pdu", |b| {
        b.iter(|| black_box(codec.decode_with_args("ModbusPDU", black_box(&pdu), &args)))
    });
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
