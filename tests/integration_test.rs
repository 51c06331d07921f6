use contig::{
    AllocError, Allocator, Codec, CodecCache, Config, DynamicWrapper, Error, Global, IntWidth, Layout, Member,
    NulTerminated, Primitive, SchemaBuilder, SchemaError, Value, Wrapper,
};
use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn derive(b: SchemaBuilder, ty: contig::TypeId) -> Arc<Codec> {
    let schema = Arc::new(b.build().unwrap());
    Arc::new(Codec::derive(&schema, ty, &Config::default()).unwrap())
}

fn text(s: &str) -> Value {
    Value::str(s)
}

fn word(at: &[u8]) -> usize {
    usize::from_ne_bytes(at[..std::mem::size_of::<usize>()].try_into().unwrap())
}

#[test]
fn test_record_with_string() {
    let mut b = SchemaBuilder::new();
    let a = b.primitive(Primitive::I32);
    let bytes = b.bytes();
    let rec = b.record("A", [Member::new("a", a), Member::new("b", bytes)]);
    let codec = derive(b, rec);

    let value = Value::record([("a", Value::Int(-5)), ("b", text("hi"))]);
    let buf = codec.encode(&value).unwrap();
    assert_eq!(buf.len(), codec.dynamic_offset() + 2);
    assert_eq!(&buf[codec.dynamic_offset()..], b"hi");

    let view = codec.view(&buf).unwrap();
    assert_eq!(view.field("a").unwrap().as_i64().unwrap(), -5);
    assert_eq!(view.field("b").unwrap().as_str().unwrap(), "hi");
    assert_eq!(view.to_value().unwrap(), value);
}

#[test]
fn test_string_sequence_offset_table() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let list = b.slice(bytes);
    let codec = derive(b, list);

    let value = Value::Seq(vec![text("a"), text("bb"), text("ccc")]);
    let buf = codec.encode(&value).unwrap();
    let dynamic = &buf[codec.dynamic_offset()..];

    let h = Layout::slice_header(IntWidth::NATIVE).size;
    let table = &dynamic[3 * h..3 * h + 8];
    assert_eq!(u32::from_ne_bytes(table[..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_ne_bytes(table[4..].try_into().unwrap()), 3);
    assert_eq!(&dynamic[3 * h + 8..], b"abbccc");

    let view = codec.view(&buf).unwrap();
    assert_eq!(view.len().unwrap(), 3);
    assert_eq!(view.get(1).unwrap().as_str().unwrap(), "bb");
    let all: Vec<String> = view.iter().unwrap().map(|v| v.unwrap().as_str().unwrap().to_owned()).collect();
    assert_eq!(all, ["a", "bb", "ccc"]);
}

#[test]
fn test_absent_optional_writes_only_header() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let payload = b.record("Payload", [Member::new("data", bytes)]);
    let maybe = b.optional_pointer(payload);
    let codec = derive(b, maybe);

    assert_eq!(codec.dynamic_size(&Value::Null, 0).unwrap(), 0);
    let buf = codec.encode(&Value::Null).unwrap();
    assert_eq!(buf.len(), codec.dynamic_offset());

    let view = codec.view(&buf).unwrap();
    assert!(view.optional().unwrap().is_none());
    assert_eq!(view.to_value().unwrap(), Value::Null);

    let present = Value::ptr(Value::record([("data", text("xyz"))]));
    let buf = codec.encode(&present).unwrap();
    let inner = codec.view(&buf).unwrap().optional().unwrap().unwrap();
    assert_eq!(inner.field("data").unwrap().as_str().unwrap(), "xyz");
}

#[test]
fn test_moved_bytes_keep_stale_addresses_until_repoint() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let codec = derive(b, bytes);

    let original = codec.encode(&text("relocate me")).unwrap();
    let old_base = original.as_ptr() as usize + codec.dynamic_offset();
    assert_eq!(word(&original), old_base);

    let mut moved = vec![0u8; original.len()];
    moved.copy_from_slice(&original);
    let new_base = moved.as_ptr() as usize + codec.dynamic_offset();
    assert_ne!(old_base, new_base);

    // Raw bytes still point at the old location.
    assert_eq!(codec.view(&moved).unwrap().address().unwrap(), old_base);

    let walked = codec.repoint_buffer(&mut moved).unwrap();
    assert_eq!(walked, "relocate me".len());
    assert_eq!(codec.view(&moved).unwrap().address().unwrap(), new_base);
    assert_eq!(codec.view(&moved).unwrap().as_str().unwrap(), "relocate me");
}

#[test]
fn test_absent_and_error_states_use_no_dynamic_bytes() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let opt = b.optional(bytes);
    let res = b.result(bytes);
    let opt_slice = b.optional_slice(bytes);
    let rec = b.record("States", [Member::new("o", opt), Member::new("r", res), Member::new("s", opt_slice)]);
    let codec = derive(b, rec);

    let value = Value::record([("o", Value::none()), ("r", Value::err(7)), ("s", Value::Null)]);
    let buf = codec.encode(&value).unwrap();
    assert_eq!(buf.len(), codec.dynamic_offset());
    assert_eq!(codec.view(&buf).unwrap().to_value().unwrap(), value);

    let full = Value::record([
        ("o", Value::some(text("x"))),
        ("r", Value::ok(text("yz"))),
        ("s", Value::Seq(vec![text("w")])),
    ]);
    assert_eq!(codec.view(&codec.encode(&full).unwrap()).unwrap().to_value().unwrap(), full);
}

#[test]
fn test_field_order_does_not_change_layout() {
    let build = |order: &[&str]| {
        let mut b = SchemaBuilder::new();
        let id = b.primitive(Primitive::U64);
        let flag = b.primitive(Primitive::Bool);
        let bytes = b.bytes();
        let tags = b.slice(bytes);
        let members: Vec<Member> = order
            .iter()
            .map(|&name| match name {
                "id" => Member::new(name, id),
                "flag" => Member::new(name, flag),
                "name" => Member::new(name, bytes),
                _ => Member::new(name, tags),
            })
            .collect();
        let rec = b.record("Item", members);
        derive(b, rec)
    };
    let a = build(&["id", "flag", "name", "tags"]);
    let b = build(&["tags", "name", "flag", "id"]);
    assert_eq!(a.static_size(), b.static_size());
    assert_eq!(a.static_align(), b.static_align());
    assert_eq!(a.fingerprint(), b.fingerprint());

    let value = Value::record([
        ("id", Value::Uint(3)),
        ("flag", Value::Bool(true)),
        ("name", text("n")),
        ("tags", Value::Seq(vec![text("t1"), text("t2")])),
    ]);
    // Written into the same bytes, both codecs produce the same image,
    // embedded addresses included.
    let len = a.buffer_size(&value).unwrap();
    assert_eq!(b.buffer_size(&value).unwrap(), len);
    let mut buf = vec![0u8; len];
    a.encode_into(&value, &mut buf).unwrap();
    let first = buf.clone();
    buf.fill(0);
    b.encode_into(&value, &mut buf).unwrap();
    assert_eq!(first, buf);

    let view = b.view(&buf).unwrap();
    for name in ["id", "flag", "name", "tags"] {
        assert_eq!(view.field(name).unwrap().to_value().unwrap(), *value.field(name).unwrap());
    }
}

#[test]
fn test_forged_length_is_reported_not_trusted() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let list = b.slice(bytes);
    let codec = derive(b, list);

    let mut buf = codec.encode(&Value::Seq(vec![text("a"), text("bb")])).unwrap();
    let at = Layout::slice_length_offset(IntWidth::NATIVE);
    buf[at..at + std::mem::size_of::<usize>()].copy_from_slice(&(usize::MAX / 2).to_ne_bytes());

    let view = codec.view(&buf).unwrap();
    assert_eq!(view.len().unwrap(), usize::MAX / 2);
    assert!(matches!(view.get(1), Err(Error::OutOfBounds { .. })));
    assert!(matches!(view.to_value(), Err(Error::OutOfBounds { .. })));
    assert!(matches!(codec.repoint_buffer(&mut buf), Err(Error::OutOfBounds { .. })));

    // A length that still fits the multiplication but not the region.
    buf[at..at + std::mem::size_of::<usize>()].copy_from_slice(&1000usize.to_ne_bytes());
    assert!(matches!(codec.view(&buf).unwrap().get(0), Err(Error::OutOfBounds { .. })));
}

#[test]
fn test_optional_pointer_to_zero_size_value_carries_a_tag() {
    let mut b = SchemaBuilder::new();
    let unit = b.void();
    let maybe = b.optional_pointer(unit);
    let codec = derive(b, maybe);
    assert_eq!(codec.static_size(), Layout::tagged_address().size);

    let present = codec.encode(&Value::ptr(Value::Void)).unwrap();
    assert_eq!(present[Layout::ADDRESS.size], 1);
    let view = codec.view(&present).unwrap();
    assert!(!view.is_null().unwrap());
    assert!(view.optional().unwrap().is_some());
    assert_eq!(view.to_value().unwrap(), Value::ptr(Value::Void));

    let absent = codec.encode(&Value::Null).unwrap();
    assert_eq!(absent[Layout::ADDRESS.size], 0);
    assert!(codec.view(&absent).unwrap().optional().unwrap().is_none());
    assert_eq!(codec.view(&absent).unwrap().to_value().unwrap(), Value::Null);
}

#[test]
fn test_wide_tag_goes_before_the_payload() {
    let mut b = SchemaBuilder::new();
    let small = b.primitive(Primitive::U8);
    let word = b.primitive(Primitive::U32);
    let bytes = b.bytes();
    let either = b.union("Either", IntWidth::U64, [Member::new("small", small), Member::new("word", word)]);
    let rec = b.record("Holder", [Member::new("either", either), Member::new("note", bytes)]);
    let codec = derive(b, rec);

    let value = Value::record([("either", Value::arm("word", Value::Uint(0xDEAD))), ("note", text("n"))]);
    let buf = codec.encode(&value).unwrap();
    let view = codec.view(&buf).unwrap();

    let either = view.field("either").unwrap();
    let header = either.header();
    assert_eq!(header.len(), 16);
    assert_eq!(u64::from_ne_bytes(header[..8].try_into().unwrap()), 1);
    assert_eq!(u32::from_ne_bytes(header[8..12].try_into().unwrap()), 0xDEAD);

    let (arm, inner) = either.arm().unwrap();
    assert_eq!(arm, "word");
    assert_eq!(inner.as_u64().unwrap(), 0xDEAD);
    assert_eq!(view.to_value().unwrap(), value);
}

#[test]
fn test_recursive_tree_roundtrip_and_clone() {
    let mut b = SchemaBuilder::new();
    let tree = b.declare("Tree");
    let label = b.bytes();
    let kids = b.slice(tree);
    b.record_into(tree, [Member::new("label", label), Member::new("kids", kids)]);
    let codec = derive(b, tree);

    let leaf = |s: &str| Value::record([("label", text(s)), ("kids", Value::Seq(vec![]))]);
    let value = Value::record([
        ("label", text("root")),
        (
            "kids",
            Value::Seq(vec![
                leaf("a"),
                Value::record([("label", text("b")), ("kids", Value::Seq(vec![leaf("b1"), leaf("b2")]))]),
                leaf("c"),
            ]),
        ),
    ]);

    let w = Wrapper::init(Arc::clone(&codec), &value).unwrap();
    let b2 = w.get().unwrap().field("kids").unwrap().get(1).unwrap().field("kids").unwrap().get(1).unwrap();
    assert_eq!(b2.field("label").unwrap().as_str().unwrap(), "b2");

    let copy = w.try_clone().unwrap();
    drop(w);
    assert_eq!(copy.to_value().unwrap(), value);
}

#[test]
fn test_linked_list_through_optional_pointer() {
    let mut b = SchemaBuilder::new();
    let node = b.declare("Node");
    let n = b.primitive(Primitive::U32);
    let next = b.optional_pointer(node);
    b.record_into(node, [Member::new("value", n), Member::new("next", next)]);
    let codec = derive(b, node);

    let mut value = Value::record([("value", Value::Uint(3)), ("next", Value::Null)]);
    for v in [2u64, 1] {
        value = Value::record([("value", Value::Uint(v)), ("next", Value::ptr(value))]);
    }

    let buf = codec.encode(&value).unwrap();
    let mut cursor = codec.view(&buf).unwrap();
    let mut seen = Vec::new();
    loop {
        seen.push(cursor.field("value").unwrap().as_u64().unwrap());
        match cursor.field("next").unwrap().optional().unwrap() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    assert_eq!(seen, [1, 2, 3]);
}

#[test]
fn test_mixed_record_roundtrip() {
    let mut b = SchemaBuilder::new();
    let u16_ = b.primitive(Primitive::U16);
    let f64_ = b.primitive(Primitive::F64);
    let flag = b.primitive(Primitive::Bool);
    let color = b.enumeration("Color", Primitive::U8, [("red", 0), ("green", 1), ("blue", 2)]);
    let arr = b.array(u16_, 3);
    let bytes = b.bytes();
    let words = b.slice(bytes);
    let boxed = b.optional_pointer(u16_);
    let cstr = b.custom("cstr", Arc::new(NulTerminated));
    let shape = b.union("Shape", IntWidth::U16, [Member::new("circle", f64_), Member::new("named", bytes)]);
    let rec = b.record(
        "Mixed",
        [
            Member::new("ratio", f64_),
            Member::new("flag", flag),
            Member::new("color", color),
            Member::new("arr", arr),
            Member::new("words", words),
            Member::new("boxed", boxed),
            Member::new("cstr", cstr),
            Member::new("shape", shape),
        ],
    );
    let codec = derive(b, rec);

    let value = Value::record([
        ("ratio", Value::Float(0.25)),
        ("flag", Value::Bool(true)),
        ("color", Value::Enum("blue".into())),
        ("arr", Value::Seq(vec![Value::Uint(1), Value::Uint(2), Value::Uint(3)])),
        ("words", Value::Seq(vec![text("one"), text(""), text("three")])),
        ("boxed", Value::ptr(Value::Uint(77))),
        ("cstr", text("terminated")),
        ("shape", Value::arm("named", text("hexagon"))),
    ]);
    let w = Wrapper::init(codec, &value).unwrap();
    assert_eq!(w.to_value().unwrap(), value);

    let view = w.get().unwrap();
    assert_eq!(view.field("color").unwrap().as_enum().unwrap(), "blue");
    assert_eq!(view.field("arr").unwrap().get(2).unwrap().as_u64().unwrap(), 3);
    assert!(view.field("words").unwrap().get(1).unwrap().is_empty().unwrap());
    assert_eq!(view.field("ratio").unwrap().as_f64().unwrap(), 0.25);
    assert!(view.field("flag").unwrap().as_bool().unwrap());

    let copy = w.try_clone().unwrap();
    assert_eq!(copy.to_value().unwrap(), value);
}

#[test]
fn test_in_place_edits_and_capacity() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let names = b.slice(bytes);
    let codec = derive(b, names);

    let mut w = Wrapper::init(codec, &Value::Seq(vec![text("alpha"), text("beta"), text("gamma")])).unwrap();
    {
        let mut view = w.get_mut().unwrap();
        view.set(0, &text("alp")).unwrap();
        view.set(2, &text("GAMMA")).unwrap();
        assert!(matches!(view.set(1, &text("much too long")), Err(Error::CapacityExceeded { needed: 13, available: 4 })));
    }
    assert_eq!(w.to_value().unwrap(), Value::Seq(vec![text("alp"), text("beta"), text("GAMMA")]));

    // Slack left by the shrink survives a clone.
    let copy = w.try_clone().unwrap();
    assert_eq!(copy.to_value().unwrap(), w.to_value().unwrap());
    assert_eq!(copy.dynamic_len(), w.dynamic_len());
}

#[test]
fn test_persist_and_adopt() {
    let mut b = SchemaBuilder::new();
    let id = b.primitive(Primitive::U32);
    let bytes = b.bytes();
    let rec = b.record("Doc", [Member::new("id", id), Member::new("body", bytes)]);
    let codec = derive(b, rec);

    let value = Value::record([("id", Value::Uint(9)), ("body", text("persisted through a file"))]);
    let w = Wrapper::init(Arc::clone(&codec), &value).unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(w.as_bytes()).unwrap();
    file.flush().unwrap();

    let mut bytes = Vec::new();
    std::fs::File::open(file.path()).unwrap().read_to_end(&mut bytes).unwrap();
    let adopted = Wrapper::adopt(codec, &bytes).unwrap();
    assert_eq!(adopted.to_value().unwrap(), value);

    let base = adopted.as_bytes().as_ptr() as usize;
    let body = adopted.get().unwrap().field("body").unwrap().address().unwrap();
    assert!((base..base + adopted.len()).contains(&body));
}

#[test]
fn test_adopt_rejects_truncated_bytes() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let list = b.slice(bytes);
    let codec = derive(b, list);

    let buf = codec.encode(&Value::Seq(vec![text("abc"), text("def")])).unwrap();
    let cut = &buf[..buf.len() - 2];
    assert!(matches!(Wrapper::adopt(Arc::clone(&codec), cut), Err(Error::OutOfBounds { .. })));
    assert!(matches!(Wrapper::adopt(codec, &buf[..2]), Err(Error::BufferTooSmall { .. })));
}

#[test]
fn test_dynamic_wrapper_with_caller_header() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let n = b.primitive(Primitive::U8);
    let rec = b.record("Msg", [Member::new("kind", n), Member::new("body", bytes)]);
    let codec = derive(b, rec);

    let mut header = vec![0u8; codec.static_size()];
    let value = Value::record([("kind", Value::Uint(2)), ("body", text("payload"))]);
    let mut dw = DynamicWrapper::init(Arc::clone(&codec), &value, &mut header).unwrap().unwrap();
    assert_eq!(dw.len(), "payload".len());
    assert_eq!(dw.get(&header).unwrap().to_value().unwrap(), value);

    let bigger = Value::record([("kind", Value::Uint(3)), ("body", text("a larger payload"))]);
    dw.set(&bigger, &mut header).unwrap();
    assert_eq!(dw.get(&header).unwrap().to_value().unwrap(), bigger);

    // A failed set leaves both halves as they were.
    let bad = Value::record([("kind", Value::Uint(300)), ("body", text("x"))]);
    assert!(matches!(dw.set(&bad, &mut header), Err(Error::OutOfRange { .. })));
    assert_eq!(dw.get(&header).unwrap().to_value().unwrap(), bigger);
}

#[derive(Clone)]
struct Refuse;

impl Allocator for Refuse {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError::new(layout))
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _layout: Layout) {}
}

#[derive(Clone)]
struct Limited {
    left: Arc<AtomicUsize>,
}

impl Allocator for Limited {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if self.left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_err() {
            return Err(AllocError::new(layout));
        }
        Global.alloc(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { Global.free(ptr, layout) }
    }
}

#[test]
fn test_allocation_failure_is_recoverable() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let codec = derive(b, bytes);

    assert!(matches!(Wrapper::init_in(Arc::clone(&codec), &text("x"), Refuse), Err(Error::Alloc(_))));

    let alloc = Limited { left: Arc::new(AtomicUsize::new(1)) };
    let mut w = Wrapper::init_in(codec, &text("kept"), alloc).unwrap();
    assert!(matches!(w.set(&text("lost")), Err(Error::Alloc(_))));
    assert!(matches!(w.try_clone(), Err(Error::Alloc(_))));
    assert_eq!(w.get().unwrap().as_str().unwrap(), "kept");
}

#[test]
fn test_cache_shared_across_threads() {
    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let list = b.slice(bytes);
    let schema = Arc::new(b.build().unwrap());
    let cache = Arc::new(CodecCache::new(schema));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get(list, &Config::default()).unwrap())
        })
        .collect();
    let codecs: Vec<Arc<Codec>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(codecs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(cache.len(), 1);

    // Read-only views of one buffer from several threads.
    let w = Arc::new(Wrapper::init(Arc::clone(&codecs[0]), &Value::Seq(vec![text("shared")])).unwrap());
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let w = Arc::clone(&w);
            std::thread::spawn(move || w.get().unwrap().get(0).unwrap().as_str().unwrap().to_owned())
        })
        .collect();
    for r in readers {
        assert_eq!(r.join().unwrap(), "shared");
    }
}

#[test]
fn test_config_from_json_controls_widths() {
    let config = Config::from_json(r#"{ "length_width": "u16", "offset_width": "u16" }"#).unwrap();
    assert!(config.recurse);
    assert_eq!(config.length_width, IntWidth::U16);

    let mut b = SchemaBuilder::new();
    let bytes = b.bytes();
    let schema = Arc::new(b.build().unwrap());
    let codec = Codec::derive(&schema, bytes, &config).unwrap();
    assert_eq!(codec.static_size(), Layout::slice_header(IntWidth::U16).size);
    assert!(matches!(codec.encode(&Value::Bytes(vec![0; 70_000])), Err(Error::LengthOverflow { .. })));

    let back = Config::from_json(&config.to_json().unwrap()).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_strict_configs_reject_raw_addresses() {
    let mut b = SchemaBuilder::new();
    let n = b.primitive(Primitive::U32);
    let p = b.pointer(n);
    let unknown = b.unknown_pointer(n);
    let schema = Arc::new(b.build().unwrap());

    let shallow = Config { expansion_budget: 0, ..Config::default() };
    let raw = Codec::derive(&schema, p, &shallow).unwrap();
    assert!(!raw.has_dynamic_payload());
    let buf = raw.encode(&Value::Address(0x1000)).unwrap();
    assert_eq!(raw.view(&buf).unwrap().to_value().unwrap(), Value::Address(0x1000));

    let strict = Config { error_on_zero_budget: true, ..shallow.clone() };
    assert!(matches!(Codec::derive(&schema, p, &strict), Err(SchemaError::BudgetExhausted(_))));
    let unsafe_off = Config { error_on_unsafe_conversion: true, ..shallow };
    assert!(matches!(Codec::derive(&schema, p, &unsafe_off), Err(SchemaError::UnsafeConversion(_))));

    assert!(matches!(Codec::derive(&schema, unknown, &Config::default()), Err(SchemaError::UnknownPointer(_))));
    let opt_in = Config { serialize_unknown_pointers_as_address: true, ..Config::default() };
    assert!(Codec::derive(&schema, unknown, &opt_in).is_ok());
}
