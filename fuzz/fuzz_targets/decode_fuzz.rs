//! Decoder fuzz target: feed arbitrary bytes to a codec built from a small schema with a
//! switch, a length-delimited array, a speculative optional and a checksum.
//! Decoding must not panic, and whatever decodes must re-encode to the same bytes and the
//! same recorded structure.
//! Build with: cargo fuzz run decode_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;
#[cfg(fuzzing)]
use std::sync::{Arc, OnceLock};
#[cfg(fuzzing)]
use wiremodel::{
    ArrayLength, ByteOrder, Case, ChecksumAlgorithm, Codec, ComplexTypeDefinition, Expr, Field, SimpleTypeReference,
    TypeReference, TypeRegistry,
};

#[cfg(fuzzing)]
fn codec() -> &'static Codec {
    static CODEC: OnceLock<Codec> = OnceLock::new();
    CODEC.get_or_init(|| {
        let u8t = || SimpleTypeReference::uint(8);
        let mut registry = TypeRegistry::new();
        registry.declare(ComplexTypeDefinition::new(
            "Trailer",
            vec![Field::assert("marker", u8t(), Expr::var("marker").equals(Expr::uint(0xEE)))],
        ));
        registry.declare(ComplexTypeDefinition::new(
            "Message",
            vec![
                Field::discriminator("kind", SimpleTypeReference::uint(4)),
                Field::simple("flags", SimpleTypeReference::uint(4)),
                Field::simple("length", u8t()),
                Field::switch(
                    &["kind"],
                    vec![
                        Case::new(
                            "Data",
                            vec![1u64.into()],
                            vec![Field::array(
                                "payload",
                                SimpleTypeReference::byte(),
                                ArrayLength::LengthInBytes(Expr::var("length")),
                            )],
                        ),
                        Case::new(
                            "Words",
                            vec![2u64.into()],
                            vec![Field::array(
                                "words",
                                SimpleTypeReference::uint(16),
                                ArrayLength::Count(Expr::var("length")),
                            )],
                        ),
                    ],
                ),
                Field::optional("trailer", TypeReference::complex("Trailer"), None),
                Field::checksum("crc", SimpleTypeReference::uint(16), ChecksumAlgorithm::Crc16Modbus, 0),
            ],
        ));
        match Codec::new(Arc::new(registry.resolve()), ByteOrder::BigEndian) {
            Ok(codec) => codec,
            Err(e) => panic!("fuzz schema is invalid: {}", e),
        }
    })
}

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let codec = codec();
    let (consumed, result) = codec.decode_with_extent("Message", data);
    if let Ok(value) = result {
        let encoded = codec.encode("Message", &value).expect("decoded value re-encodes");
        assert_eq!(encoded.as_slice(), &data[..consumed]);
        let (_, read) = codec.decode_structured("Message", data, &[]).expect("decodes again");
        let (_, written) = codec.encode_structured("Message", &value, &[]).expect("re-encodes");
        assert_eq!(read, written);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run decode_fuzz");
}
