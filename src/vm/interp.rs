use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::ast::*;

use super::value::{Closure, FunctionRef, TableRef, Value};
use super::{State, VmError};

type Result<T> = std::result::Result<T, VmError>;

/// Lexical scope. A closure captures a scope together with how many of its
/// variables existed at capture time, so locals declared later in the same
/// block stay invisible to it.
pub struct Scope {
    vars: RefCell<Vec<(Rc<str>, Rc<RefCell<Value>>)>>,
    parent: Option<(Rc<Scope>, usize)>,
}

impl Scope {
    fn new(parent: Option<(Rc<Scope>, usize)>) -> Rc<Scope> {
        Rc::new(Scope { vars: RefCell::new(Vec::new()), parent })
    }

    fn child(parent: &Rc<Scope>) -> Rc<Scope> {
        Scope::new(Some((parent.clone(), parent.len())))
    }

    fn len(&self) -> usize {
        self.vars.borrow().len()
    }

    fn declare(&self, name: &str, value: Value) -> Rc<RefCell<Value>> {
        let cell = Rc::new(RefCell::new(value));
        self.vars.borrow_mut().push((Rc::from(name), cell.clone()));
        cell
    }

    /// Splits an unshared scope into its variable cells and its parent.
    pub(super) fn into_parts(self) -> (Vec<Rc<RefCell<Value>>>, Option<Rc<Scope>>) {
        let Scope { vars, parent } = self;
        (vars.into_inner().into_iter().map(|(_, cell)| cell).collect(), parent.map(|(scope, _)| scope))
    }

    fn lookup(&self, name: &str) -> Option<Rc<RefCell<Value>>> {
        let mut scope = self;
        let mut limit = usize::MAX;
        loop {
            {
                let vars = scope.vars.borrow();
                let visible = &vars[..limit.min(vars.len())];
                if let Some((_, cell)) = visible.iter().rev().find(|(n, _)| &**n == name) {
                    return Some(cell.clone());
                }
            }
            let (parent, len) = scope.parent.as_ref()?;
            scope = &**parent;
            limit = *len;
        }
    }
}

enum Flow {
    Normal,
    Break,
    Return(Vec<Value>),
}

enum Place {
    Local(Rc<RefCell<Value>>),
    Global(Rc<str>),
    Field(Value, Value),
}

struct Frame<'s> {
    state: &'s State,
    env: TableRef,
    varargs: Vec<Value>,
    source: Rc<ChunkInfo>,
    current: Cell<Span>,
}

/// Run a script closure with `args`, returning everything it returns.
pub fn call_closure(state: &State, closure: &Closure, args: Vec<Value>) -> Result<Vec<Value>> {
    let body = &closure.body;
    let scope = match &closure.scope {
        Some(captured) => Scope::child(captured),
        None => Scope::new(None),
    };
    let mut args = args.into_iter();
    for param in &body.params {
        scope.declare(param, args.next().unwrap_or_default());
    }
    let varargs = if body.is_vararg { args.collect() } else { Vec::new() };
    let env = closure.env.borrow().clone();
    let frame = Frame { state, env, varargs, source: body.source.clone(), current: Cell::new(Span::UNKNOWN) };

    match frame.exec_stmts(&body.block, &scope)? {
        Flow::Return(values) => Ok(values),
        Flow::Normal | Flow::Break => Ok(Vec::new()),
    }
}

impl Frame<'_> {
    fn error(&self, message: impl std::fmt::Display) -> VmError {
        let line = self.source.line_of(self.current.get());
        VmError::runtime(format!("{}:{}: {}", self.source.name, line, message))
    }

    // ── Statements ───────────────────────────────────────────────────

    fn exec_block(&self, block: &Block, scope: &Rc<Scope>) -> Result<Flow> {
        if self.state.stack_exhausted() {
            return Err(self.error("stack overflow"));
        }
        self.exec_stmts(block, &Scope::child(scope))
    }

    fn exec_stmts(&self, block: &Block, scope: &Rc<Scope>) -> Result<Flow> {
        for stmt in block {
            self.current.set(stmt.span);
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow> {
        match stmt {
            Stmt::Local { names, values } => {
                let mut values = self.eval_list(values, scope)?.into_iter();
                for name in names {
                    scope.declare(name, values.next().unwrap_or_default());
                }
            }
            Stmt::Assign { targets, values } => {
                let places = targets
                    .iter()
                    .map(|t| self.place(t, scope))
                    .collect::<Result<Vec<_>>>()?;
                let mut values = self.eval_list(values, scope)?.into_iter();
                for place in places {
                    self.assign(place, values.next().unwrap_or_default())?;
                }
            }
            Stmt::Call(expr) => {
                self.eval_multi(expr, scope)?;
            }
            Stmt::Do(block) => return self.exec_block(block, scope),
            Stmt::While { condition, body } => {
                while self.eval(condition, scope)?.truthy() {
                    match self.exec_block(body, scope)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret => return Ok(ret),
                    }
                }
            }
            Stmt::Repeat { body, condition } => loop {
                let inner = Scope::child(scope);
                match self.exec_stmts(body, &inner)? {
                    Flow::Normal => {}
                    Flow::Break => break,
                    ret => return Ok(ret),
                }
                if self.eval(condition, &inner)?.truthy() {
                    break;
                }
            },
            Stmt::If { branches, otherwise } => {
                for (condition, block) in branches {
                    if self.eval(condition, scope)?.truthy() {
                        return self.exec_block(block, scope);
                    }
                }
                if let Some(block) = otherwise {
                    return self.exec_block(block, scope);
                }
            }
            Stmt::NumericFor { var, start, limit, step, body } => {
                return self.numeric_for(var, start, limit, step.as_ref(), body, scope);
            }
            Stmt::GenericFor { names, exprs, body } => {
                let mut init = self.eval_list(exprs, scope)?.into_iter();
                let iter = init.next().unwrap_or_default();
                let invariant = init.next().unwrap_or_default();
                let mut control = init.next().unwrap_or_default();
                loop {
                    let args = vec![invariant.clone(), control.clone()];
                    let results = self.call(iter.clone(), args, || " (for iterator)".to_string())?;
                    let first = results.first().cloned().unwrap_or_default();
                    if first.is_nil() {
                        break;
                    }
                    control = first;
                    let inner = Scope::child(scope);
                    let mut results = results.into_iter();
                    for name in names {
                        inner.declare(name, results.next().unwrap_or_default());
                    }
                    match self.exec_stmts(body, &inner)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret => return Ok(ret),
                    }
                }
            }
            Stmt::Function { target, body } => {
                let place = self.place(target, scope)?;
                let closure = self.closure(body, scope);
                self.assign(place, closure)?;
            }
            Stmt::LocalFunction { name, body } => {
                let cell = scope.declare(name, Value::Nil);
                let closure = self.closure(body, scope);
                *cell.borrow_mut() = closure;
            }
            Stmt::Return(values) => return Ok(Flow::Return(self.eval_list(values, scope)?)),
            Stmt::Break => return Ok(Flow::Break),
        }
        Ok(Flow::Normal)
    }

    fn numeric_for(
        &self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        scope: &Rc<Scope>,
    ) -> Result<Flow> {
        let start = self.for_number(start, scope, "initial")?;
        let limit = self.for_number(limit, scope, "limit")?;
        let step = match step {
            Some(e) => self.for_number(e, scope, "step")?,
            None => Value::Integer(1),
        };

        let run = |value: Value| -> Result<Option<Flow>> {
            let inner = Scope::child(scope);
            inner.declare(var, value);
            match self.exec_stmts(body, &inner)? {
                Flow::Normal => Ok(None),
                Flow::Break => Ok(Some(Flow::Normal)),
                ret => Ok(Some(ret)),
            }
        };

        if let (Value::Integer(start), Value::Integer(step)) = (&start, &step) {
            let (start, step) = (*start as i128, *step as i128);
            if step == 0 {
                return Err(self.error("'for' step is zero"));
            }
            let limit = match limit {
                Value::Integer(i) => i as i128,
                Value::Number(f) if f.is_nan() => return Ok(Flow::Normal),
                Value::Number(f) if step > 0 => f.floor().clamp(i64::MIN as f64, i64::MAX as f64) as i128,
                Value::Number(f) => f.ceil().clamp(i64::MIN as f64, i64::MAX as f64) as i128,
                _ => return Ok(Flow::Normal),
            };
            let mut i = start;
            while (step > 0 && i <= limit) || (step < 0 && i >= limit) {
                if let Some(flow) = run(Value::Integer(i as i64))? {
                    return Ok(flow);
                }
                i += step;
            }
        } else {
            let (start, limit, step) = (
                start.to_number().unwrap_or(0.0),
                limit.to_number().unwrap_or(0.0),
                step.to_number().unwrap_or(0.0),
            );
            if step == 0.0 {
                return Err(self.error("'for' step is zero"));
            }
            let mut i = start;
            while (step > 0.0 && i <= limit) || (step < 0.0 && i >= limit) {
                if let Some(flow) = run(Value::Number(i))? {
                    return Ok(flow);
                }
                i += step;
            }
        }
        Ok(Flow::Normal)
    }

    fn for_number(&self, expr: &Expr, scope: &Rc<Scope>, what: &str) -> Result<Value> {
        match self.eval(expr, scope)? {
            v @ (Value::Integer(_) | Value::Number(_)) => Ok(v),
            other => other
                .to_arith()
                .ok_or_else(|| self.error(format!("'for' {} value must be a number", what))),
        }
    }

    fn place(&self, target: &Expr, scope: &Rc<Scope>) -> Result<Place> {
        match target {
            Expr::Name(name) => Ok(match scope.lookup(name) {
                Some(cell) => Place::Local(cell),
                None => Place::Global(Rc::from(name.as_str())),
            }),
            Expr::Index { object, key } => {
                let obj = self.eval(object, scope)?;
                if !matches!(obj, Value::Table(_)) {
                    return Err(self.error(format!(
                        "attempt to index a {} value{}",
                        obj.type_name(),
                        self.describe(object, scope)
                    )));
                }
                Ok(Place::Field(obj, self.eval(key, scope)?))
            }
            _ => Err(self.error("cannot assign to this expression")),
        }
    }

    fn assign(&self, place: Place, value: Value) -> Result<()> {
        match place {
            Place::Local(cell) => {
                let old = cell.replace(value);
                drop(old);
            }
            Place::Global(name) => self.env.set_str(&name, value),
            Place::Field(Value::Table(t), key) => {
                t.set(key, value).map_err(|e| self.error(e))?;
            }
            Place::Field(other, _) => {
                return Err(self.error(format!("attempt to index a {} value", other.type_name())));
            }
        }
        Ok(())
    }

    fn closure(&self, body: &Rc<FuncBody>, scope: &Rc<Scope>) -> Value {
        let captured = Scope::child(scope);
        Value::Function(FunctionRef::script(body.clone(), Some(captured), self.env.clone()))
    }

    // ── Expressions ──────────────────────────────────────────────────

    /// Evaluate a list, expanding the last expression to all of its values.
    fn eval_list(&self, exprs: &[Expr], scope: &Rc<Scope>) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(exprs.len());
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() && expr.is_multi() {
                out.extend(self.eval_multi(expr, scope)?);
            } else {
                out.push(self.eval(expr, scope)?);
            }
        }
        Ok(out)
    }

    fn eval_multi(&self, expr: &Expr, scope: &Rc<Scope>) -> Result<Vec<Value>> {
        match expr {
            Expr::Vararg => Ok(self.varargs.clone()),
            Expr::Call { function, args } => {
                let f = self.eval(function, scope)?;
                let args = self.eval_list(args, scope)?;
                self.call(f, args, || self.describe(function, scope))
            }
            Expr::Method { object, name, args } => {
                let obj = self.eval(object, scope)?;
                let f = self.index(&obj, &Value::string(name), || self.describe(object, scope))?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(obj);
                full.extend(self.eval_list(args, scope)?);
                self.call(f, full, || format!(" (method '{}')", name))
            }
            other => Ok(vec![self.eval(other, scope)?]),
        }
    }

    fn call(&self, f: Value, args: Vec<Value>, describe: impl FnOnce() -> String) -> Result<Vec<Value>> {
        if !matches!(f, Value::Function(_)) {
            return Err(self.error(format!("attempt to call a {} value{}", f.type_name(), describe())));
        }
        self.state.set_call_site(&self.source, self.current.get());
        self.state.call_value(f, args)
    }

    fn eval(&self, expr: &Expr, scope: &Rc<Scope>) -> Result<Value> {
        if self.state.stack_exhausted() {
            return Err(self.error("stack overflow"));
        }
        Ok(match expr {
            Expr::Nil => Value::Nil,
            Expr::True => Value::Boolean(true),
            Expr::False => Value::Boolean(false),
            Expr::Integer(i) => Value::Integer(*i),
            Expr::Number(n) => Value::Number(*n),
            Expr::String(s) => Value::string(s),
            Expr::Vararg => self.varargs.first().cloned().unwrap_or_default(),
            Expr::VarargIndex(index) => {
                let n = self.eval(index, scope)?;
                let n = n
                    .to_integer()
                    .ok_or_else(|| self.error(format!("vararg index must be an integer, got {}", n.type_name())))?;
                usize::try_from(n)
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| self.varargs.get(i).cloned())
                    .unwrap_or_default()
            }
            Expr::Function(body) => self.closure(body, scope),
            Expr::Table(fields) => self.table(fields, scope)?,
            Expr::Name(name) => match scope.lookup(name) {
                Some(cell) => cell.borrow().clone(),
                None => self.env.get_str(name),
            },
            Expr::Index { object, key } => {
                let obj = self.eval(object, scope)?;
                let key = self.eval(key, scope)?;
                self.index(&obj, &key, || self.describe(object, scope))?
            }
            Expr::Call { .. } | Expr::Method { .. } => {
                self.eval_multi(expr, scope)?.into_iter().next().unwrap_or_default()
            }
            Expr::Paren(inner) => self.eval(inner, scope)?,
            Expr::BinOp { op: BinOp::And, left, right } => {
                let l = self.eval(left, scope)?;
                if l.truthy() { self.eval(right, scope)? } else { l }
            }
            Expr::BinOp { op: BinOp::Or, left, right } => {
                let l = self.eval(left, scope)?;
                if l.truthy() { l } else { self.eval(right, scope)? }
            }
            Expr::BinOp { op, left, right } => {
                let l = self.eval(left, scope)?;
                let r = self.eval(right, scope)?;
                self.binop(*op, l, r, left, right, scope)?
            }
            Expr::UnOp { op, operand } => {
                let v = self.eval(operand, scope)?;
                match op {
                    UnOp::Not => Value::Boolean(!v.truthy()),
                    UnOp::Neg => match v.to_arith() {
                        Some(Value::Integer(i)) => Value::Integer(i.wrapping_neg()),
                        Some(Value::Number(f)) => Value::Number(-f),
                        _ => {
                            return Err(self.error(format!(
                                "attempt to perform arithmetic on a {} value{}",
                                v.type_name(),
                                self.describe(operand, scope)
                            )));
                        }
                    },
                    UnOp::Len => match &v {
                        Value::String(s) => Value::Integer(s.len() as i64),
                        Value::Table(t) => Value::Integer(t.len()),
                        _ => {
                            return Err(self.error(format!(
                                "attempt to get length of a {} value{}",
                                v.type_name(),
                                self.describe(operand, scope)
                            )));
                        }
                    },
                }
            }
        })
    }

    fn table(&self, fields: &[Field], scope: &Rc<Scope>) -> Result<Value> {
        let table = TableRef::new();
        let mut n = 0i64;
        for (i, field) in fields.iter().enumerate() {
            match field {
                Field::Positional(expr) if i + 1 == fields.len() && expr.is_multi() => {
                    for v in self.eval_multi(expr, scope)? {
                        n += 1;
                        table.set(Value::Integer(n), v).map_err(|e| self.error(e))?;
                    }
                }
                Field::Positional(expr) => {
                    let v = self.eval(expr, scope)?;
                    n += 1;
                    table.set(Value::Integer(n), v).map_err(|e| self.error(e))?;
                }
                Field::Keyed { key, value } => {
                    let k = self.eval(key, scope)?;
                    let v = self.eval(value, scope)?;
                    table.set(k, v).map_err(|e| self.error(e))?;
                }
            }
        }
        Ok(Value::Table(table))
    }

    fn index(&self, obj: &Value, key: &Value, describe: impl FnOnce() -> String) -> Result<Value> {
        match obj {
            Value::Table(t) => Ok(t.get(key)),
            Value::String(_) => Ok(self.state.string_lib().map(|lib| lib.get(key)).unwrap_or_default()),
            other => Err(self.error(format!("attempt to index a {} value{}", other.type_name(), describe()))),
        }
    }

    /// Names the variable an expression came from, for error messages.
    fn describe(&self, expr: &Expr, scope: &Rc<Scope>) -> String {
        match expr {
            Expr::Name(name) if scope.lookup(name).is_some() => format!(" (local '{}')", name),
            Expr::Name(name) => format!(" (global '{}')", name),
            Expr::Index { key, .. } => match &**key {
                Expr::String(k) => format!(" (field '{}')", k),
                _ => String::new(),
            },
            Expr::Method { name, .. } => format!(" (method '{}')", name),
            _ => String::new(),
        }
    }

    fn binop(&self, op: BinOp, l: Value, r: Value, left: &Expr, right: &Expr, scope: &Rc<Scope>) -> Result<Value> {
        match op {
            BinOp::Eq => Ok(Value::Boolean(l.raw_equal(&r))),
            BinOp::Ne => Ok(Value::Boolean(!l.raw_equal(&r))),
            BinOp::Lt => self.compare(&l, &r, |o| o.is_lt()),
            BinOp::Le => self.compare(&l, &r, |o| o.is_le()),
            BinOp::Gt => self.compare(&r, &l, |o| o.is_lt()),
            BinOp::Ge => self.compare(&r, &l, |o| o.is_le()),
            BinOp::Concat => {
                let piece = |v: &Value, e: &Expr| match v {
                    Value::String(s) => Ok(s.to_string()),
                    Value::Integer(_) | Value::Number(_) => Ok(v.to_string()),
                    other => Err(self.error(format!(
                        "attempt to concatenate a {} value{}",
                        other.type_name(),
                        self.describe(e, scope)
                    ))),
                };
                let mut s = piece(&l, left)?;
                s.push_str(&piece(&r, right)?);
                Ok(Value::String(Rc::from(s)))
            }
            _ => {
                let bad = |v: &Value, e: &Expr| {
                    self.error(format!(
                        "attempt to perform arithmetic on a {} value{}",
                        v.type_name(),
                        self.describe(e, scope)
                    ))
                };
                let a = l.to_arith().ok_or_else(|| bad(&l, left))?;
                let b = r.to_arith().ok_or_else(|| bad(&r, right))?;
                arith(op, &a, &b).map_err(|msg| self.error(msg))
            }
        }
    }

    fn compare(&self, a: &Value, b: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value> {
        let ordering = match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
            (Value::Integer(_) | Value::Number(_), Value::Integer(_) | Value::Number(_)) => {
                a.to_number().zip(b.to_number()).and_then(|(x, y)| x.partial_cmp(&y))
            }
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => {
                let (ta, tb) = (a.type_name(), b.type_name());
                return Err(if ta == tb {
                    self.error(format!("attempt to compare two {} values", ta))
                } else {
                    self.error(format!("attempt to compare {} with {}", ta, tb))
                });
            }
        };
        // NaN compares false both ways.
        Ok(Value::Boolean(ordering.is_some_and(test)))
    }
}

/// Arithmetic on two numeric operands with integer/float rules.
pub fn arith(op: BinOp, a: &Value, b: &Value) -> std::result::Result<Value, String> {
    if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
        let (x, y) = (*x, *y);
        match op {
            BinOp::Add => return Ok(Value::Integer(x.wrapping_add(y))),
            BinOp::Sub => return Ok(Value::Integer(x.wrapping_sub(y))),
            BinOp::Mul => return Ok(Value::Integer(x.wrapping_mul(y))),
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err("attempt to perform 'n//0'".into());
                }
                let q = x.wrapping_div(y);
                let adjust = x.wrapping_rem(y) != 0 && ((x < 0) != (y < 0));
                return Ok(Value::Integer(if adjust { q - 1 } else { q }));
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err("attempt to perform 'n%%0'".into());
                }
                let r = x.wrapping_rem(y);
                return Ok(Value::Integer(if r != 0 && (r ^ y) < 0 { r + y } else { r }));
            }
            _ => {}
        }
    }
    let (x, y) = match (a.to_number(), b.to_number()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err("attempt to perform arithmetic on a non-number value".into()),
    };
    Ok(Value::Number(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Pow => x.powf(y),
        BinOp::FloorDiv => (x / y).floor(),
        BinOp::Mod => {
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
        }
        other => return Err(format!("'{}' is not an arithmetic operator", other.symbol())),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MULTRET;

    fn eval(code: &str) -> Vec<Value> {
        let state = State::new();
        state.open_libs();
        eval_in(&state, code)
    }

    fn eval_in(state: &State, code: &str) -> Vec<Value> {
        state.load(code, "test").unwrap();
        state.call(0, MULTRET).unwrap();
        let n = state.top();
        let out = (1..=n).map(|i| state.value_at(i)).collect();
        state.set_top(0);
        out
    }

    fn eval_err(code: &str) -> String {
        let state = State::new();
        state.open_libs();
        state.load(code, "test").unwrap();
        state.call(0, 0).unwrap_err().to_string()
    }

    fn one(code: &str) -> String {
        eval(code)[0].to_string()
    }

    #[test]
    fn integer_and_float_arithmetic() {
        assert_eq!(one("return 1 + 2"), "3");
        assert_eq!(one("return 7 // 2"), "3");
        assert_eq!(one("return -7 // 2"), "-4");
        assert_eq!(one("return -7 % 3"), "2");
        assert_eq!(one("return 7 / 2"), "3.5");
        assert_eq!(one("return 4 / 2"), "2.0");
        assert_eq!(one("return 2 ^ 10"), "1024.0");
        assert_eq!(one("return 1.5 + 1"), "2.5");
        assert_eq!(one("return '10' + 5"), "15");
        assert_eq!(one("return math.maxinteger + 1 == math.mininteger"), "true");
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        assert!(eval_err("return 1 // 0").contains("'n//0'"));
        assert!(eval_err("return 1 % 0").contains("'n%%0'"));
        assert_eq!(one("return 1 / 0"), "inf");
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(one("return 1 < 2"), "true");
        assert_eq!(one("return 'a' < 'b'"), "true");
        assert_eq!(one("return 1 == 1.0"), "true");
        assert_eq!(one("return 3 >= 4"), "false");
        assert!(eval_err("return 1 < 'x'").contains("attempt to compare number with string"));
    }

    #[test]
    fn short_circuit_logic() {
        assert_eq!(one("return nil or 'default'"), "default");
        assert_eq!(one("return false and error('never')"), "false");
        assert_eq!(one("return 1 and 2"), "2");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(one("return 'a' .. 1 .. 'b' .. 2.5"), "a1b2.5");
        assert!(eval_err("return 'a' .. {}").contains("attempt to concatenate a table value"));
    }

    #[test]
    fn locals_and_closures_capture_by_reference() {
        let code = "
            local function counter()
              local n = 0
              return function() n = n + 1 return n end
            end
            local c = counter()
            c() c()
            return c()";
        assert_eq!(one(code), "3");
    }

    #[test]
    fn closures_do_not_see_later_locals() {
        let code = "
            x = 'global'
            local f = function() return x end
            local x = 'local'
            return f(), x";
        let out = eval(code);
        assert_eq!(out[0].to_string(), "global");
        assert_eq!(out[1].to_string(), "local");
    }

    #[test]
    fn loop_variables_are_fresh_per_iteration() {
        let code = "
            local fs = {}
            for i = 1, 3 do fs[i] = function() return i end end
            return fs[1]() + fs[2]() + fs[3]()";
        assert_eq!(one(code), "6");
    }

    #[test]
    fn numeric_for_variants() {
        assert_eq!(one("local s = 0 for i = 10, 1, -3 do s = s + i end return s"), "22");
        assert_eq!(one("local s = 0 for i = 1, 2, 0.5 do s = s + i end return s"), "4.5");
        assert_eq!(one("local n = 0 for i = 1, 0 do n = n + 1 end return n"), "0");
        assert!(eval_err("for i = 1, 2, 0 do end").contains("'for' step is zero"));
    }

    #[test]
    fn generic_for_with_pairs_and_ipairs() {
        assert_eq!(one("local s = 0 for _, v in ipairs({1, 2, 3}) do s = s + v end return s"), "6");
        assert_eq!(one("local n = 0 for k in pairs({a = 1, b = 2}) do n = n + 1 end return n"), "2");
    }

    #[test]
    fn while_repeat_and_break() {
        assert_eq!(one("local i = 0 while true do i = i + 1 if i == 5 then break end end return i"), "5");
        assert_eq!(one("local i = 0 repeat local j = i i = i + 1 until j >= 3 return i"), "4");
    }

    #[test]
    fn multiple_assignment_and_results() {
        assert_eq!(one("local a, b = 1, 2 a, b = b, a return a"), "2");
        let out = eval("local function f() return 1, 2, 3 end return f()");
        assert_eq!(out.len(), 3);
        let out = eval("local function f() return 1, 2, 3 end return (f())");
        assert_eq!(out.len(), 1);
        let out = eval("local function f() return 1, 2, 3 end return f(), 10");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn table_constructors() {
        assert_eq!(one("local t = {1, 2, x = 'y', [10] = 'z'} return #t"), "2");
        assert_eq!(one("local t = {x = 'y'} return t.x"), "y");
        assert_eq!(one("local function f() return 1, 2 end local t = {f()} return #t"), "2");
        assert_eq!(one("local function f() return 1, 2 end local t = {f(), 5} return #t"), "2");
    }

    #[test]
    fn varargs_and_indexing() {
        let state = State::new();
        state.load("return ...[1] + ...[2]", "sum").unwrap();
        state.push(Value::Integer(4));
        state.push(Value::Integer(5));
        state.call(2, 1).unwrap();
        assert_eq!(state.value_at(1).to_integer(), Some(9));
        assert_eq!(one("return select('#', ...)"), "0");
        assert_eq!(one("local function f(...) return ...[3] end return f(1, 2)"), "nil");
    }

    #[test]
    fn methods_and_string_methods() {
        let code = "
            local obj = {n = 4}
            function obj:double() return self.n * 2 end
            return obj:double(), ('abc'):upper()";
        let out = eval(code);
        assert_eq!(out[0].to_string(), "8");
        assert_eq!(out[1].to_string(), "ABC");
    }

    #[test]
    fn runtime_errors_name_the_culprit() {
        assert!(eval_err("return undefined_fn()").contains("attempt to call a nil value (global 'undefined_fn')"));
        assert!(eval_err("local t = nil return t.x").contains("attempt to index a nil value (local 't')"));
        assert!(eval_err("local t = {} return t.a.b").contains("(field 'a')"));
        assert!(eval_err("\n\nreturn nil + 1").starts_with("test:3:"));
    }

    #[test]
    fn closures_inherit_environment() {
        let state = State::new();
        state.load("function get() return value end", "env").unwrap();
        let env = TableRef::new();
        env.set_str("value", Value::Integer(5));
        state.push(Value::Table(env.clone()));
        assert!(state.set_environment(1).unwrap());
        state.call(0, 0).unwrap();
        // `get` was defined in the rebound environment and reads from it
        assert!(state.globals().get_str("get").is_nil());
        let get = env.get_str("get");
        let out = state.call_value(get, Vec::new()).unwrap();
        assert_eq!(out[0].to_integer(), Some(5));
    }
}
