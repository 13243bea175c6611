use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use moonbridge::vm::MULTRET;
use moonbridge::{Error, FunctionHandle, Key, Map, Options, Session, TableHandle, Value};

fn session() -> Session {
    Session::with_options(Options { open_libs: true, ..Options::default() })
}

fn map(entries: Vec<(&str, Value)>) -> Map {
    entries.into_iter().map(|(k, v)| (Key::from(k), v)).collect()
}

// --- Round trips ---

#[test]
fn primitives_survive_a_table_round_trip() {
    let s = session();
    let t = s.create_table().unwrap();
    let samples = vec![
        Value::Boolean(true),
        Value::Boolean(false),
        Value::Integer(0),
        Value::Integer(i64::MAX),
        Value::Integer(i64::MIN),
        Value::Number(0.5),
        Value::Number(-1e300),
        Value::Number(f64::MIN_POSITIVE),
        Value::from(""),
        Value::from("nul\0inside"),
        Value::from("ünïcödé"),
    ];
    for (i, v) in samples.iter().enumerate() {
        t.set(i as i64 + 1, v.clone()).unwrap();
    }
    s.set_global("src", t).unwrap();
    s.run_string("dst = {} for i, v in ipairs(src) do dst[i] = v end").unwrap();

    let dst = s.get_global("dst").unwrap();
    let dst = dst.as_table().unwrap();
    for (i, expected) in samples.iter().enumerate() {
        let got = dst.get(i as i64 + 1).unwrap();
        assert_eq!(&got, expected, "slot {}", i + 1);
        assert_eq!(got.type_name(), expected.type_name());
    }
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn nested_tables_round_trip_through_maps() {
    let s = session();
    let original = map(vec![
        ("name", Value::from("root")),
        ("count", Value::from(3)),
        ("ratio", Value::from(0.25)),
        (
            "child",
            Value::Map(map(vec![
                ("flag", Value::from(true)),
                (
                    "grandchild",
                    Value::Map(map(vec![(
                        "leaf",
                        Value::Map(map(vec![("depth", Value::from(4)), ("tag", Value::from("deep"))])),
                    )])),
                ),
            ])),
        ),
    ]);
    let t = TableHandle::from_map_in(&s, &original).unwrap();
    assert_eq!(t.to_map().unwrap(), original);

    s.set_global("t", t).unwrap();
    let depth = s.eval("return t.child.grandchild.leaf.depth").unwrap();
    assert_eq!(depth, vec![Value::Integer(4)]);
}

#[test]
fn cyclic_tables_are_safe_through_handles_only() {
    let s = session();
    s.run_string("loop = {name = 'loop'} loop.me = loop").unwrap();
    let t = s.get_global("loop").unwrap();
    let t = t.as_table().unwrap();

    let me = t.get("me").unwrap();
    let me = me.as_table().unwrap();
    assert!(me.same_value(t).unwrap());
    assert_eq!(me.get("name").unwrap(), Value::from("loop"));

    assert!(matches!(t.to_map(), Err(Error::CyclicTable)));
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn overly_deep_tables_hit_the_conversion_limit() {
    let s = Session::with_options(Options { max_conversion_depth: 4, ..Options::default() });
    s.run_string("deep = {a = {b = {c = {d = {e = 1}}}}}").unwrap();
    let deep = s.get_global_instance("deep").unwrap().unwrap();
    let err = s.convert_instance(&deep).unwrap_err();
    assert!(matches!(err, Error::NestingTooDeep { limit: 4 }));
    assert_eq!(s.stack_top(), 0);
}

// --- Handle lifecycle ---

#[test]
fn removed_handles_fail_and_remove_is_idempotent() {
    let s = session();
    let t = s.create_table().unwrap();
    t.set("k", 1).unwrap();
    let h = t.handle().clone();

    s.remove_instance(&h);
    assert!(!t.is_valid());
    assert!(matches!(t.get("k"), Err(Error::InvalidHandle)));
    assert!(matches!(t.set("k", 2), Err(Error::InvalidHandle)));
    assert!(matches!(t.to_map(), Err(Error::InvalidHandle)));
    assert!(matches!(s.set_global("g", t.clone()), Err(Error::InvalidHandle)));
    assert!(matches!(s.convert_instance(&h), Err(Error::InvalidHandle)));

    s.remove_instance(&h);
    assert_eq!(s.live_instances(), 0);
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn removed_function_handles_fail_every_operation() {
    let s = session();
    let f = s.load("return 1", "f").unwrap();
    let env = s.create_table().unwrap();
    let h = f.handle().clone();

    s.remove_instance(&h);
    assert!(!f.is_valid());
    assert!(matches!(f.call(), Err(Error::InvalidHandle)));
    assert!(matches!(f.call_with_argument(1), Err(Error::InvalidHandle)));
    assert!(matches!(f.call_with_results(&[], MULTRET), Err(Error::InvalidHandle)));
    assert!(matches!(f.is_native(), Err(Error::InvalidHandle)));
    assert!(matches!(f.environment(), Err(Error::InvalidHandle)));
    assert!(matches!(f.set_environment(Some(env.clone())), Err(Error::InvalidHandle)));
    assert!(matches!(f.set_environment(None), Err(Error::InvalidHandle)));
    assert!(matches!(s.set_global("g", f.clone()), Err(Error::InvalidHandle)));

    // a live function with a removed environment table is rejected too
    let g = s.load("return who", "g").unwrap();
    s.remove_instance(&env);
    assert!(matches!(g.set_environment(Some(env)), Err(Error::InvalidHandle)));
    assert_eq!(g.call().unwrap(), Value::Nil);

    assert_eq!(s.live_instances(), 1);
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn dropping_the_session_invalidates_every_handle() {
    let s = session();
    let t = s.create_table().unwrap();
    let f = s.load("return 1", "f").unwrap();
    assert!(t.is_valid() && f.is_valid());

    drop(s);
    assert!(!t.is_valid());
    assert!(!f.is_valid());
    assert!(t.session().is_none());
    assert!(matches!(t.get("x"), Err(Error::InvalidHandle)));
    assert!(matches!(f.call(), Err(Error::InvalidHandle)));
    assert!(!f.invalidate());
}

#[test]
fn each_pull_yields_an_independent_handle() {
    let s = session();
    s.run_string("config = {}").unwrap();
    let a = s.get_global_instance("config").unwrap().unwrap();
    let b = s.get_global_instance("config").unwrap().unwrap();
    assert_ne!(a, b);
    assert!(a.same_value(&b).unwrap());
    assert_eq!(s.live_instances(), 2);

    s.remove_instance(&a);
    assert!(b.is_valid());
    assert_eq!(s.live_instances(), 1);
}

#[test]
fn primitive_globals_have_no_instance() {
    let s = session();
    s.run_string("n = 5").unwrap();
    assert!(s.get_global_instance("n").unwrap().is_none());
    assert!(s.get_global_instance("missing").unwrap().is_none());
}

// --- Cross-session use ---

#[test]
fn foreign_handles_are_rejected_without_touching_either_stack() {
    let a = session();
    let b = session();
    let from_a = a.create_table().unwrap();
    let f_b = b.load("return ...", "echo").unwrap();

    assert!(matches!(b.set_global("stolen", from_a.clone()), Err(Error::CrossSessionHandle)));
    assert!(matches!(
        f_b.call_with_arguments(&[Value::Table(from_a.clone())]),
        Err(Error::CrossSessionHandle)
    ));
    let t_b = b.create_table().unwrap();
    assert!(matches!(t_b.set("k", from_a.clone()), Err(Error::CrossSessionHandle)));
    assert!(matches!(
        t_b.set("nested", Value::Map(map(vec![("inner", Value::Table(from_a.clone()))]))),
        Err(Error::CrossSessionHandle)
    ));

    b.remove_instance(from_a.handle());
    assert!(from_a.is_valid());
    assert_eq!(a.stack_top(), 0);
    assert_eq!(b.stack_top(), 0);
    assert!(b.get_global("stolen").unwrap().is_nil());
}

#[test]
fn opaque_host_values_are_unsupported() {
    let s = session();
    let opaque = Value::Opaque(Rc::new(42u8));
    assert!(matches!(s.set_global("o", opaque), Err(Error::UnsupportedType { type_name: "opaque" })));
    assert_eq!(s.stack_top(), 0);
}

// --- Calls ---

#[test]
fn multiple_results_follow_the_requested_count() {
    let s = session();
    let f = s.load("return 'a', 'b', 'c'", "three").unwrap();
    let all = f.call_with_results(&[], 3).unwrap();
    assert_eq!(all, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    let first = f.call_with_results(&[], 1).unwrap();
    assert_eq!(first, vec![Value::from("a")]);
    let padded = f.call_with_results(&[], 5).unwrap();
    assert_eq!(padded.len(), 5);
    assert!(padded[3].is_nil() && padded[4].is_nil());
    assert_eq!(f.call_with_results(&[], MULTRET).unwrap().len(), 3);
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn invalid_result_counts_are_runtime_errors() {
    let s = session();
    let f = s.load("return 'a'", "one").unwrap();
    for nresults in [-2, -7, i32::MIN, i32::MAX] {
        let err = f.call_with_results(&[Value::from(1)], nresults).unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }), "{}: {:?}", nresults, err);
        assert_eq!(s.stack_top(), 0);
    }
    assert_eq!(f.call_with_results(&[], 2).unwrap(), vec![Value::from("a"), Value::Nil]);
}

#[test]
fn run_string_sets_globals() {
    let s = Session::new();
    s.run_string("x = 1 + 2").unwrap();
    assert_eq!(s.get_global("x").unwrap(), Value::Integer(3));
}

#[test]
fn vararg_source_functions() {
    let s = session();
    let f = FunctionHandle::from_source_in(&s, "return ...[1] + ...[2]").unwrap();
    let out = f.call_with_results(&[Value::from(4), Value::from(5)], 1).unwrap();
    assert_eq!(out, vec![Value::Integer(9)]);

    let shared = FunctionHandle::from_source("return ...[1] + ...[2]").unwrap();
    assert_eq!(shared.call_with_arguments(&[Value::from(4), Value::from(5)]).unwrap(), Value::Integer(9));
}

#[test]
fn compile_failures_leave_no_trace() {
    let s = session();
    s.run_string("keep = 1").unwrap();
    let err = s.run_string("keep = 2 +").unwrap_err();
    assert!(matches!(err, Error::Compile { .. }));
    assert_eq!(s.get_global("keep").unwrap(), Value::Integer(1));
    assert!(matches!(s.load("function (", "bad"), Err(Error::Compile { .. })));
    assert_eq!(s.stack_top(), 0);
    assert_eq!(s.live_instances(), 0);
}

#[test]
fn runaway_recursion_is_a_runtime_error() {
    let s = Session::with_options(Options { max_call_depth: 30, open_libs: true, ..Options::default() });
    let err = s.run_string("local function f() return f() + 1 end f()").unwrap_err();
    assert!(matches!(&err, Error::Runtime { message } if message.contains("stack overflow")));
    assert_eq!(s.stack_top(), 0);
    assert_eq!(s.eval("return 1").unwrap(), vec![Value::Integer(1)]);
}

#[test]
fn deep_recursion_on_a_small_thread_is_a_runtime_error() {
    let message = std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(|| {
            let s = Session::with_options(Options { max_call_depth: 1_000_000, open_libs: true, ..Options::default() });
            let err = s.run_string("local function f(n) return f(n + 1) + 1 end f(1)").unwrap_err();
            assert_eq!(s.stack_top(), 0);
            assert_eq!(s.eval("return 2").unwrap(), vec![Value::Integer(2)]);
            err.to_string()
        })
        .unwrap()
        .join()
        .unwrap();
    assert!(message.contains("stack overflow"), "{}", message);
}

#[test]
fn hostile_inputs_fail_cleanly() {
    let s = session();
    let cases = [
        "return select(math.mininteger, 1, 2)".to_string(),
        "return string.format('%99999999999999999999d', 1)".to_string(),
        "return string.format('%.4000000000f', 1)".to_string(),
        format!("x = 1{}", " + 1".repeat(10_000)),
        format!("f{}", "()".repeat(200_000)),
    ];
    for code in &cases {
        assert!(s.run_string(code).is_err(), "accepted: {:.60}", code);
        assert_eq!(s.stack_top(), 0);
    }
    let err = s.run_string(&format!("x = t{}", ".a".repeat(50_000))).unwrap_err();
    assert!(matches!(&err, Error::Compile { message, .. } if message.contains("too many syntax levels")), "{:?}", err);
}

#[test]
fn deep_structures_are_released_without_overflow() {
    let s = session();
    s.run_string("local t = {} for i = 1, 200000 do t = {t} end").unwrap();
    s.run_string("local f = function() return 0 end for i = 1, 200000 do local g = f f = function() return g end end")
        .unwrap();
    s.run_string("deep = {} for i = 1, 200000 do deep = {next = deep} end").unwrap();
    s.set_global("deep", Value::Nil).unwrap();
    assert_eq!(s.eval("return 1").unwrap(), vec![Value::Integer(1)]);
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn shared_sessions_are_per_thread() {
    let here = FunctionHandle::from_source("marker = 'main' return marker").unwrap();
    assert_eq!(here.call().unwrap(), Value::from("main"));
    let seen = std::thread::spawn(|| {
        FunctionHandle::from_source("return marker").unwrap().call().unwrap().to_string()
    })
    .join()
    .unwrap();
    assert_eq!(seen, "nil");
    assert!(Session::shared().ptr_eq(&here.session().unwrap()));
}

#[test]
fn host_callbacks_can_call_back_into_the_session() {
    let s = session();
    let square = s.load("return ...[1] * ...[1]", "square").unwrap();
    let sum_of_squares = s
        .create_function(move |_, args| {
            let mut total = 0;
            for arg in args {
                let sq = square.call_with_argument(arg)?;
                total += sq.as_integer().unwrap_or(0);
            }
            Ok(vec![Value::from(total)])
        })
        .unwrap();
    s.set_global("sumsq", sum_of_squares).unwrap();
    assert_eq!(s.eval("return sumsq(1, 2, 3)").unwrap(), vec![Value::Integer(14)]);
    let caught = s.eval("return pcall(sumsq, 'x')").unwrap();
    assert_eq!(caught[0], Value::Boolean(false));
    assert_eq!(s.stack_top(), 0);
}

#[test]
fn print_output_goes_to_the_sink() {
    let s = session();
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = lines.clone();
    s.state().set_print_sink(move |line| sink.borrow_mut().push(line.to_string()));
    s.run_string("print('a', 1, nil) print(2.5)").unwrap();
    assert_eq!(*lines.borrow(), vec!["a\t1\tnil".to_string(), "2.5".to_string()]);
}

// --- Files ---

#[test]
fn run_file_and_load_file() {
    let s = session();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "y = 40 + 2").unwrap();
    writeln!(file, "return y").unwrap();

    s.run_file(file.path()).unwrap();
    assert_eq!(s.get_global("y").unwrap(), Value::Integer(42));

    let f = FunctionHandle::from_file_in(&s, file.path()).unwrap();
    assert_eq!(f.call().unwrap(), Value::Integer(42));

    let missing = file.path().with_extension("absent");
    assert!(matches!(s.run_file(&missing), Err(Error::Io { .. })));
}

#[test]
fn file_chunks_report_their_path() {
    let s = session();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "local a = 1").unwrap();
    writeln!(file, "local b = = 2").unwrap();
    let err = s.run_file(file.path()).unwrap_err();
    match err {
        Error::Compile { chunk, line, .. } => {
            assert_eq!(chunk, file.path().display().to_string());
            assert_eq!(line, 2);
        }
        other => panic!("expected a compile error, got {:?}", other),
    }
}

// --- Stack balance under random use ---

#[test]
fn random_operation_sequences_keep_the_stack_balanced() {
    let s = session();
    let foreign = session();
    let alien = foreign.create_table().unwrap();
    s.run_string(
        "function pick(x) if type(x) == 'number' and x > 5 then error('too big') end return x, x end \
         store = {}",
    )
    .unwrap();
    let pick = s.get_global("pick").unwrap().as_function().unwrap().clone();
    let store = s.get_global("store").unwrap().as_table().unwrap().clone();

    let mut rng = fastrand::Rng::with_seed(0x6d6f6f6e);
    let names = ["a", "b", "c", "store", "pick"];
    for step in 0..1000 {
        let value = match rng.u8(0..7) {
            0 => Value::Nil,
            1 => Value::from(rng.i64(-10..10)),
            2 => Value::from(rng.f64()),
            3 => Value::from(names[rng.usize(..names.len())]),
            4 => Value::Table(store.clone()),
            5 => Value::Table(alien.clone()),
            _ => Value::Opaque(Rc::new(step)),
        };
        let before = s.stack_top();
        let name = names[rng.usize(..3)];
        let _ = match rng.u8(0..6) {
            0 => s.set_global(name, value).map(drop),
            1 => s.get_global(name).map(drop),
            2 => store.get(value).map(drop),
            3 => store.set(value, rng.i64(..)).map(drop),
            4 => pick.call_with_arguments(&[value]).map(drop),
            _ => pick.call_with_results(&[value], rng.i32(-1..4)).map(drop),
        };
        assert_eq!(s.stack_top(), before, "step {}", step);
    }
    assert_eq!(foreign.stack_top(), 0);
}
