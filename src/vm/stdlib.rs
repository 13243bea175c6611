use std::fmt::Display;
use std::rc::Rc;

use super::value::{float_to_integer, format_float, parse_number, FunctionRef, TableRef, Value};
use super::{State, VmError};

type Result<T> = std::result::Result<T, VmError>;

/// Largest string `string.rep` will build.
const MAX_STRING_LEN: usize = 1 << 26;
/// Most values `unpack` will push in one call.
const MAX_UNPACK: i64 = 1 << 20;
/// Width and precision in a `string.format` directive are at most two digits.
const MAX_FORMAT_DIGITS: usize = 2;

fn native(f: impl Fn(&State) -> Result<usize> + 'static) -> Value {
    Value::Function(FunctionRef::native(Rc::new(f)))
}

fn register(table: &TableRef, funcs: &[(&str, fn(&State) -> Result<usize>)]) {
    for (name, f) in funcs {
        table.set_str(name, native(*f));
    }
}

/// Install the base functions and the `string`, `math` and `table` libraries.
pub fn open(state: &State) {
    let globals = state.globals();
    register(
        &globals,
        &[
            ("print", print),
            ("type", type_),
            ("tostring", tostring),
            ("tonumber", tonumber),
            ("ipairs", ipairs),
            ("select", select),
            ("error", error),
            ("assert", assert),
            ("pcall", pcall),
            ("rawget", rawget),
            ("rawset", rawset),
            ("rawequal", rawequal),
            ("rawlen", rawlen),
            ("unpack", unpack),
        ],
    );

    let next_fn = native(next);
    globals.set_str("next", next_fn.clone());
    globals.set_str(
        "pairs",
        native(move |state| {
            let t = check_table(state, 1, "pairs")?;
            state.push(next_fn.clone());
            state.push(Value::Table(t));
            state.push(Value::Nil);
            Ok(3)
        }),
    );

    let string = TableRef::new();
    register(
        &string,
        &[
            ("len", str_len),
            ("sub", str_sub),
            ("upper", str_upper),
            ("lower", str_lower),
            ("rep", str_rep),
            ("format", str_format),
        ],
    );
    globals.set_str("string", Value::Table(string.clone()));
    state.set_string_lib(string);

    let math = TableRef::new();
    register(
        &math,
        &[
            ("floor", math_floor),
            ("ceil", math_ceil),
            ("abs", math_abs),
            ("max", math_max),
            ("min", math_min),
            ("sqrt", math_sqrt),
            ("tointeger", math_tointeger),
            ("type", math_type),
        ],
    );
    math.set_str("huge", Value::Number(f64::INFINITY));
    math.set_str("pi", Value::Number(std::f64::consts::PI));
    math.set_str("maxinteger", Value::Integer(i64::MAX));
    math.set_str("mininteger", Value::Integer(i64::MIN));
    globals.set_str("math", Value::Table(math));

    let table = TableRef::new();
    register(&table, &[("insert", tbl_insert), ("remove", tbl_remove), ("concat", tbl_concat)]);
    globals.set_str("table", Value::Table(table));
}

// ── Argument checking ────────────────────────────────────────────────

fn arg_error(state: &State, n: i32, fname: &str, msg: impl Display) -> VmError {
    let at = state.location().map(|loc| loc + " ").unwrap_or_default();
    VmError::runtime(format!("{}bad argument #{} to '{}' ({})", at, n, fname, msg))
}

fn type_error(state: &State, n: i32, fname: &str, expected: &str) -> VmError {
    let got = state.type_at(n).map_or("no value", |t| t.name());
    arg_error(state, n, fname, format!("{} expected, got {}", expected, got))
}

fn check_any(state: &State, n: i32, fname: &str) -> Result<Value> {
    match state.type_at(n) {
        Some(_) => Ok(state.value_at(n)),
        None => Err(arg_error(state, n, fname, "value expected")),
    }
}

fn check_table(state: &State, n: i32, fname: &str) -> Result<TableRef> {
    match state.value_at(n) {
        Value::Table(t) => Ok(t),
        _ => Err(type_error(state, n, fname, "table")),
    }
}

fn check_integer(state: &State, n: i32, fname: &str) -> Result<i64> {
    let v = state.value_at(n);
    match v.to_integer() {
        Some(i) => Ok(i),
        None if v.to_number().is_some() => {
            Err(arg_error(state, n, fname, "number has no integer representation"))
        }
        None => Err(type_error(state, n, fname, "number")),
    }
}

fn opt_integer(state: &State, n: i32, fname: &str, default: i64) -> Result<i64> {
    if state.value_at(n).is_nil() { Ok(default) } else { check_integer(state, n, fname) }
}

fn check_number(state: &State, n: i32, fname: &str) -> Result<f64> {
    state.value_at(n).to_number().ok_or_else(|| type_error(state, n, fname, "number"))
}

/// Integer or float operand, keeping its subtype.
fn check_arith(state: &State, n: i32, fname: &str) -> Result<Value> {
    state.value_at(n).to_arith().ok_or_else(|| type_error(state, n, fname, "number"))
}

fn check_string(state: &State, n: i32, fname: &str) -> Result<Rc<str>> {
    match state.value_at(n) {
        Value::String(s) => Ok(s),
        v @ (Value::Integer(_) | Value::Number(_)) => Ok(Rc::from(v.to_string())),
        _ => Err(type_error(state, n, fname, "string")),
    }
}

fn push_string(state: &State, s: String) -> Result<usize> {
    state.push(Value::String(Rc::from(s)));
    Ok(1)
}

// ── Base functions ───────────────────────────────────────────────────

fn print(state: &State) -> Result<usize> {
    let line = (1..=state.top())
        .map(|i| state.value_at(i).to_string())
        .collect::<Vec<_>>()
        .join("\t");
    state.print(&line);
    Ok(0)
}

fn type_(state: &State) -> Result<usize> {
    let v = check_any(state, 1, "type")?;
    state.push(Value::string(v.type_name()));
    Ok(1)
}

fn tostring(state: &State) -> Result<usize> {
    let v = check_any(state, 1, "tostring")?;
    push_string(state, v.to_string())
}

fn tonumber(state: &State) -> Result<usize> {
    let v = check_any(state, 1, "tonumber")?;
    let out = if state.value_at(2).is_nil() {
        match v {
            Value::Integer(_) | Value::Number(_) => v,
            Value::String(s) => parse_number(&s).unwrap_or_default(),
            _ => Value::Nil,
        }
    } else {
        let base = check_integer(state, 2, "tonumber")?;
        if !(2..=36).contains(&base) {
            return Err(arg_error(state, 2, "tonumber", "base out of range"));
        }
        let s = check_string(state, 1, "tonumber")?;
        let s = s.trim().to_ascii_lowercase();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.as_str()),
        };
        i64::from_str_radix(digits, base as u32)
            .ok()
            .map(|n| Value::Integer(if negative { n.wrapping_neg() } else { n }))
            .unwrap_or_default()
    };
    state.push(out);
    Ok(1)
}

fn next(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "next")?;
    match t.next(&state.value_at(2))? {
        Some((k, v)) => {
            state.push(k);
            state.push(v);
            Ok(2)
        }
        None => {
            state.push(Value::Nil);
            Ok(1)
        }
    }
}

fn ipairs(state: &State) -> Result<usize> {
    let t = check_any(state, 1, "ipairs")?;
    state.push(native(|state| {
        let t = check_table(state, 1, "ipairs")?;
        let i = check_integer(state, 2, "ipairs")?.wrapping_add(1);
        let v = t.get(&Value::Integer(i));
        if v.is_nil() {
            return Ok(0);
        }
        state.push(Value::Integer(i));
        state.push(v);
        Ok(2)
    }));
    state.push(t);
    state.push(Value::Integer(0));
    Ok(3)
}

fn select(state: &State) -> Result<usize> {
    let count = i64::from(state.top() - 1);
    if let Value::String(s) = state.value_at(1) {
        if &*s == "#" {
            state.push(Value::Integer(count));
            return Ok(1);
        }
    }
    let n = check_integer(state, 1, "select")?;
    // The selected arguments are already the top slots of the frame.
    if n < 0 {
        if n < -count {
            return Err(arg_error(state, 1, "select", "index out of range"));
        }
        Ok((-n) as usize)
    } else if n == 0 {
        Err(arg_error(state, 1, "select", "index out of range"))
    } else {
        Ok((count - n + 1).max(0) as usize)
    }
}

fn error(state: &State) -> Result<usize> {
    let level = opt_integer(state, 2, "error", 1)?;
    let value = match state.value_at(1) {
        Value::String(s) if level > 0 => match state.location() {
            Some(loc) => Value::String(Rc::from(format!("{} {}", loc, s))),
            None => Value::String(s),
        },
        other => other,
    };
    Err(VmError::Runtime(value))
}

fn assert(state: &State) -> Result<usize> {
    let v = check_any(state, 1, "assert")?;
    if v.truthy() {
        return Ok(state.top() as usize);
    }
    match state.value_at(2) {
        Value::Nil => Err(VmError::runtime("assertion failed!")),
        msg => Err(VmError::Runtime(msg)),
    }
}

fn pcall(state: &State) -> Result<usize> {
    let f = check_any(state, 1, "pcall")?;
    let args = (2..=state.top()).map(|i| state.value_at(i)).collect();
    match state.call_value(f, args) {
        Ok(results) => {
            let n = results.len();
            state.push(Value::Boolean(true));
            for v in results {
                state.push(v);
            }
            Ok(n + 1)
        }
        Err(e) => {
            state.push(Value::Boolean(false));
            state.push(match e {
                VmError::Runtime(v) => v,
                syntax => Value::String(Rc::from(syntax.to_string())),
            });
            Ok(2)
        }
    }
}

fn rawget(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "rawget")?;
    state.push(t.get(&state.value_at(2)));
    Ok(1)
}

fn rawset(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "rawset")?;
    t.set(state.value_at(2), state.value_at(3))?;
    state.push(Value::Table(t));
    Ok(1)
}

fn rawequal(state: &State) -> Result<usize> {
    let a = check_any(state, 1, "rawequal")?;
    let b = check_any(state, 2, "rawequal")?;
    state.push(Value::Boolean(a.raw_equal(&b)));
    Ok(1)
}

fn rawlen(state: &State) -> Result<usize> {
    match state.value_at(1) {
        Value::Table(t) => state.push(Value::Integer(t.len())),
        Value::String(s) => state.push(Value::Integer(s.len() as i64)),
        _ => return Err(arg_error(state, 1, "rawlen", "table or string expected")),
    }
    Ok(1)
}

fn unpack(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "unpack")?;
    let i = opt_integer(state, 2, "unpack", 1)?;
    let j = if state.value_at(3).is_nil() { t.len() } else { check_integer(state, 3, "unpack")? };
    if i > j {
        return Ok(0);
    }
    let n = j.saturating_sub(i).saturating_add(1);
    if n >= MAX_UNPACK {
        return Err(VmError::runtime("too many results to unpack"));
    }
    for k in i..=j {
        state.push(t.get(&Value::Integer(k)));
    }
    Ok(n as usize)
}

// ── string ───────────────────────────────────────────────────────────

fn str_len(state: &State) -> Result<usize> {
    let s = check_string(state, 1, "len")?;
    state.push(Value::Integer(s.len() as i64));
    Ok(1)
}

fn str_sub(state: &State) -> Result<usize> {
    let s = check_string(state, 1, "sub")?;
    let len = s.len() as i64;
    let i = opt_integer(state, 2, "sub", 1)?;
    let j = opt_integer(state, 3, "sub", -1)?;
    let start = match i {
        i if i < 0 => (len + i + 1).max(1),
        0 => 1,
        i => i,
    };
    let end = if j < 0 { len + j + 1 } else { j.min(len) };
    let out = if start > end {
        String::new()
    } else {
        String::from_utf8_lossy(&s.as_bytes()[(start - 1) as usize..end as usize]).into_owned()
    };
    push_string(state, out)
}

fn str_upper(state: &State) -> Result<usize> {
    let s = check_string(state, 1, "upper")?;
    push_string(state, s.to_ascii_uppercase())
}

fn str_lower(state: &State) -> Result<usize> {
    let s = check_string(state, 1, "lower")?;
    push_string(state, s.to_ascii_lowercase())
}

fn str_rep(state: &State) -> Result<usize> {
    let s = check_string(state, 1, "rep")?;
    let n = check_integer(state, 2, "rep")?;
    let sep = match state.value_at(3) {
        Value::Nil => Rc::from(""),
        _ => check_string(state, 3, "rep")?,
    };
    if n <= 0 {
        return push_string(state, String::new());
    }
    let total = (s.len() + sep.len()).saturating_mul(n as usize);
    if total > MAX_STRING_LEN {
        return Err(VmError::runtime("resulting string too large"));
    }
    push_string(state, vec![&*s; n as usize].join(&*sep))
}

#[derive(Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

fn str_format(state: &State) -> Result<usize> {
    let fmt = check_string(state, 1, "format")?;
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut arg = 1;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                '0' => spec.zero = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = digits(&mut chars)?.unwrap_or(0);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(digits(&mut chars)?.unwrap_or(0));
        }
        let conv = chars
            .next()
            .ok_or_else(|| VmError::runtime("invalid conversion '%' to 'format'"))?;
        arg += 1;

        let (body, numeric) = match conv {
            'd' | 'i' => (signed(&spec, check_integer(state, arg, "format")?.to_string()), true),
            'u' => (check_integer(state, arg, "format")?.to_string(), true),
            'c' => {
                let code = check_integer(state, arg, "format")?;
                let c = u32::try_from(code).ok().and_then(char::from_u32).unwrap_or('\u{fffd}');
                (c.to_string(), false)
            }
            'x' => (format!("{:x}", check_integer(state, arg, "format")?), true),
            'X' => (format!("{:X}", check_integer(state, arg, "format")?), true),
            'o' => (format!("{:o}", check_integer(state, arg, "format")?), true),
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                let x = check_number(state, arg, "format")?;
                (signed(&spec, format_c_float(x, conv, &spec)), x.is_finite())
            }
            's' => {
                let s = state.value_at(arg);
                if state.type_at(arg).is_none() {
                    return Err(arg_error(state, arg, "format", "no value"));
                }
                let mut s = s.to_string();
                if let Some(p) = spec.precision {
                    s = s.chars().take(p).collect();
                }
                (s, false)
            }
            'q' => (quoted(state, arg)?, false),
            other => {
                return Err(VmError::runtime(format!(
                    "invalid conversion '%{}' to 'format'",
                    other
                )));
            }
        };
        out.push_str(&pad(body, &spec, numeric));
    }

    push_string(state, out)
}

fn digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Option<usize>> {
    let mut n: Option<usize> = None;
    let mut count = 0;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        count += 1;
        if count > MAX_FORMAT_DIGITS {
            return Err(VmError::runtime("invalid conversion (width or precision too long) to 'format'"));
        }
        n = Some(n.unwrap_or(0) * 10 + d as usize);
        chars.next();
    }
    Ok(n)
}

fn signed(spec: &Spec, s: String) -> String {
    if s.starts_with('-') {
        s
    } else if spec.plus {
        format!("+{}", s)
    } else if spec.space {
        format!(" {}", s)
    } else {
        s
    }
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill = spec.width - len;
    if spec.left {
        format!("{}{}", body, " ".repeat(fill))
    } else if spec.zero && numeric {
        let sign_len = usize::from(body.starts_with(['-', '+', ' ']));
        format!("{}{}{}", &body[..sign_len], "0".repeat(fill), &body[sign_len..])
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn format_c_float(x: f64, conv: char, spec: &Spec) -> String {
    let upper = conv.is_ascii_uppercase();
    if !x.is_finite() {
        let s = format_float(x);
        return if upper { s.to_uppercase() } else { s };
    }
    let precision = spec.precision.unwrap_or(6);
    match conv.to_ascii_lowercase() {
        'e' => exponential(x, precision, upper),
        'f' => format!("{:.*}", precision, x),
        _ => general(x, precision, spec.alt, upper),
    }
}

/// `%e`: mantissa plus a signed exponent of at least two digits.
fn exponential(x: f64, precision: usize, upper: bool) -> String {
    let s = format!("{:.*e}", precision, x);
    let (mantissa, exp) = s.split_once('e').unwrap_or((&s, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mantissa, e, if exp < 0 { '-' } else { '+' }, exp.abs())
}

/// `%g`: shortest of fixed and exponential for the given significant digits.
fn general(x: f64, precision: usize, alt: bool, upper: bool) -> String {
    let p = precision.max(1);
    let exp: i32 = if x == 0.0 {
        0
    } else {
        let s = format!("{:.*e}", p - 1, x);
        s.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0)
    };
    let s = if exp < -4 || exp >= p as i32 {
        exponential(x, p - 1, upper)
    } else {
        format!("{:.*}", (p as i32 - 1 - exp).max(0) as usize, x)
    };
    if alt {
        return s;
    }
    let (mantissa, suffix) = match s.find(['e', 'E']) {
        Some(i) => s.split_at(i),
        None => (s.as_str(), ""),
    };
    if !mantissa.contains('.') {
        return s;
    }
    let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", mantissa, suffix)
}

fn quoted(state: &State, arg: i32) -> Result<String> {
    match state.value_at(arg) {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\0' => out.push_str("\\0"),
                    c if c.is_ascii_control() => out.push_str(&format!("\\{}", c as u32)),
                    c => out.push(c),
                }
            }
            out.push('"');
            Ok(out)
        }
        v @ (Value::Nil | Value::Boolean(_) | Value::Integer(_)) => Ok(v.to_string()),
        Value::Number(f) if f.is_finite() => Ok(format!("{:?}", f)),
        Value::Number(f) if f.is_nan() => Ok("(0/0)".into()),
        Value::Number(f) => Ok(if f > 0.0 { "1e9999".into() } else { "-1e9999".into() }),
        _ => Err(arg_error(state, arg, "format", "value has no literal form")),
    }
}

// ── math ─────────────────────────────────────────────────────────────

fn float_or_integer(f: f64) -> Value {
    float_to_integer(f).map_or(Value::Number(f), Value::Integer)
}

fn math_floor(state: &State) -> Result<usize> {
    let v = match check_arith(state, 1, "floor")? {
        Value::Number(f) => float_or_integer(f.floor()),
        v => v,
    };
    state.push(v);
    Ok(1)
}

fn math_ceil(state: &State) -> Result<usize> {
    let v = match check_arith(state, 1, "ceil")? {
        Value::Number(f) => float_or_integer(f.ceil()),
        v => v,
    };
    state.push(v);
    Ok(1)
}

fn math_abs(state: &State) -> Result<usize> {
    let v = match check_arith(state, 1, "abs")? {
        Value::Integer(i) => Value::Integer(i.wrapping_abs()),
        Value::Number(f) => Value::Number(f.abs()),
        v => v,
    };
    state.push(v);
    Ok(1)
}

fn extreme(state: &State, fname: &str, pick_later: fn(f64, f64) -> bool) -> Result<usize> {
    let mut best = check_arith(state, 1, fname)?;
    for i in 2..=state.top() {
        let v = check_arith(state, i, fname)?;
        let (a, b) = (v.to_number().unwrap_or(f64::NAN), best.to_number().unwrap_or(f64::NAN));
        if pick_later(a, b) {
            best = v;
        }
    }
    state.push(best);
    Ok(1)
}

fn math_max(state: &State) -> Result<usize> {
    extreme(state, "max", |a, b| a > b)
}

fn math_min(state: &State) -> Result<usize> {
    extreme(state, "min", |a, b| a < b)
}

fn math_sqrt(state: &State) -> Result<usize> {
    let x = check_number(state, 1, "sqrt")?;
    state.push(Value::Number(x.sqrt()));
    Ok(1)
}

fn math_tointeger(state: &State) -> Result<usize> {
    let v = match state.value_at(1) {
        Value::Integer(i) => Value::Integer(i),
        Value::Number(f) => float_to_integer(f).map_or(Value::Nil, Value::Integer),
        _ => Value::Nil,
    };
    state.push(v);
    Ok(1)
}

fn math_type(state: &State) -> Result<usize> {
    let v = match check_any(state, 1, "type")? {
        Value::Integer(_) => Value::string("integer"),
        Value::Number(_) => Value::string("float"),
        _ => Value::Nil,
    };
    state.push(v);
    Ok(1)
}

// ── table ────────────────────────────────────────────────────────────

fn tbl_insert(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "insert")?;
    let n = t.len();
    match state.top() {
        2 => t.set(Value::Integer(n + 1), state.value_at(2))?,
        3 => {
            let pos = check_integer(state, 2, "insert")?;
            if pos < 1 || pos > n + 1 {
                return Err(arg_error(state, 2, "insert", "position out of bounds"));
            }
            for i in (pos..=n).rev() {
                t.set(Value::Integer(i + 1), t.get(&Value::Integer(i)))?;
            }
            t.set(Value::Integer(pos), state.value_at(3))?;
        }
        _ => return Err(VmError::runtime("wrong number of arguments to 'insert'")),
    }
    Ok(0)
}

fn tbl_remove(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "remove")?;
    let size = t.len();
    let mut pos = opt_integer(state, 2, "remove", size)?;
    if pos != size && (pos < 1 || pos > size + 1) {
        return Err(arg_error(state, 2, "remove", "position out of bounds"));
    }
    let removed = t.get(&Value::Integer(pos));
    while pos < size {
        t.set(Value::Integer(pos), t.get(&Value::Integer(pos + 1)))?;
        pos += 1;
    }
    t.set(Value::Integer(pos), Value::Nil)?;
    state.push(removed);
    Ok(1)
}

fn tbl_concat(state: &State) -> Result<usize> {
    let t = check_table(state, 1, "concat")?;
    let sep = match state.value_at(2) {
        Value::Nil => Rc::from(""),
        _ => check_string(state, 2, "concat")?,
    };
    let i = opt_integer(state, 3, "concat", 1)?;
    let j = if state.value_at(4).is_nil() { t.len() } else { check_integer(state, 4, "concat")? };
    let mut parts = Vec::new();
    let mut k = i;
    while k <= j {
        match t.get(&Value::Integer(k)) {
            Value::String(s) => parts.push(s.to_string()),
            v @ (Value::Integer(_) | Value::Number(_)) => parts.push(v.to_string()),
            v => {
                return Err(VmError::runtime(format!(
                    "invalid value (at index {}) in table for 'concat' ({})",
                    k,
                    v.type_name()
                )));
            }
        }
        k += 1;
    }
    push_string(state, parts.join(&*sep))
}
