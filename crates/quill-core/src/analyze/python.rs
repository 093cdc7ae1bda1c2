//! Read/write set extraction for Python cells.
//!
//! Two passes over the AST:
//!
//! 1. [`collect_bindings`] gathers the names bound at statement scope:
//!    assignment targets (including tuple/list unpacking and augmented
//!    assignment), `for` targets, `with ... as` names, `except ... as`
//!    names, match-pattern captures, walrus targets, function and class
//!    definitions, and import bindings. Function and class bodies are not
//!    descended into; only the defined name escapes.
//! 2. [`ReadCollector`] walks every expression with a scope stack. A name in
//!    a Load context is a read of the cell unless it is bound in an
//!    enclosing inner scope (function, lambda, comprehension, class body),
//!    is in the cell's own write set, or is a builtin.
//!
//! Inner scopes reuse pass 1 on their own bodies, which gives Python's
//! whole-body local semantics: a name assigned anywhere in a function is
//! local throughout it and never counts as a cell read.

use std::collections::BTreeSet;

use rustpython_parser::{ast, Parse};

use super::builtins::is_builtin;

/// Derive `(reads, writes)` for a Python cell.
///
/// Invalid source yields empty sets; the syntax error surfaces when the
/// kernel compiles the cell.
pub fn analyze(source: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    let body = match ast::Suite::parse(source, "<cell>") {
        Ok(body) => body,
        Err(_) => return (BTreeSet::new(), BTreeSet::new()),
    };

    let writes = collect_bindings(&body);
    let mut collector = ReadCollector {
        reads: BTreeSet::new(),
        cell_writes: &writes,
        scopes: Vec::new(),
    };
    for stmt in &body {
        collector.visit_stmt(stmt);
    }
    (collector.reads, writes)
}

/// Names bound at the statement scope of `body`.
///
/// Also used to pre-compute the locals of nested function and class bodies.
/// Names declared `global` or `nonlocal` are not locals of that body.
fn collect_bindings(body: &[ast::Stmt]) -> BTreeSet<String> {
    let mut bound = BTreeSet::new();
    let mut declared = BTreeSet::new();
    collect_into(body, &mut bound, &mut declared);
    for name in &declared {
        bound.remove(name);
    }
    bound
}

fn collect_into(body: &[ast::Stmt], out: &mut BTreeSet<String>, declared: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                for target in targets {
                    bind_target(target, out);
                }
                collect_walrus(value, out);
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                bind_target(target, out);
                collect_walrus(value, out);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => {
                // A bare annotation (`x: int`) does not bind at runtime.
                if let Some(value) = value {
                    bind_target(target, out);
                    collect_walrus(value, out);
                }
            }
            ast::Stmt::For(ast::StmtFor { target, iter, body, orelse, .. })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor { target, iter, body, orelse, .. }) => {
                bind_target(target, out);
                collect_walrus(iter, out);
                collect_into(body, out, declared);
                collect_into(orelse, out, declared);
            }
            ast::Stmt::While(ast::StmtWhile { test, body, orelse, .. }) => {
                collect_walrus(test, out);
                collect_into(body, out, declared);
                collect_into(orelse, out, declared);
            }
            ast::Stmt::If(ast::StmtIf { test, body, orelse, .. }) => {
                collect_walrus(test, out);
                collect_into(body, out, declared);
                collect_into(orelse, out, declared);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    collect_walrus(&item.context_expr, out);
                    if let Some(vars) = &item.optional_vars {
                        bind_target(vars, out);
                    }
                }
                collect_into(body, out, declared);
            }
            ast::Stmt::Try(ast::StmtTry { body, handlers, orelse, finalbody, .. })
            | ast::Stmt::TryStar(ast::StmtTryStar { body, handlers, orelse, finalbody, .. }) => {
                collect_into(body, out, declared);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(name) = &h.name {
                        out.insert(name.as_str().to_string());
                    }
                    collect_into(&h.body, out, declared);
                }
                collect_into(orelse, out, declared);
                collect_into(finalbody, out, declared);
            }
            ast::Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                collect_walrus(subject, out);
                for case in cases {
                    bind_pattern(&case.pattern, out);
                    collect_into(&case.body, out, declared);
                }
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef { name, .. })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { name, .. }) => {
                out.insert(name.as_str().to_string());
            }
            ast::Stmt::ClassDef(ast::StmtClassDef { name, .. }) => {
                out.insert(name.as_str().to_string());
            }
            ast::Stmt::Import(ast::StmtImport { names, .. })
            | ast::Stmt::ImportFrom(ast::StmtImportFrom { names, .. }) => {
                for alias in names {
                    if let Some(binding) = alias_binding(alias) {
                        out.insert(binding);
                    }
                }
            }
            ast::Stmt::Global(ast::StmtGlobal { names, .. })
            | ast::Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => {
                for name in names {
                    declared.insert(name.as_str().to_string());
                }
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => {
                collect_walrus(value, out);
            }
            ast::Stmt::Return(ast::StmtReturn { value: Some(value), .. }) => {
                collect_walrus(value, out);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                collect_walrus(test, out);
                if let Some(msg) = msg {
                    collect_walrus(msg, out);
                }
            }
            _ => {}
        }
    }
}

/// Add the names bound by an assignment-like target.
///
/// Attribute and subscript targets mutate objects, not namespace names.
fn bind_target(target: &ast::Expr, out: &mut BTreeSet<String>) {
    match target {
        ast::Expr::Name(name) => {
            out.insert(name.id.as_str().to_string());
        }
        ast::Expr::Tuple(ast::ExprTuple { elts, .. })
        | ast::Expr::List(ast::ExprList { elts, .. }) => {
            for elt in elts {
                bind_target(elt, out);
            }
        }
        ast::Expr::Starred(ast::ExprStarred { value, .. }) => bind_target(value, out),
        _ => {}
    }
}

/// Collect walrus (`:=`) targets from an expression tree.
///
/// Lambda bodies are their own scope and are skipped; comprehension walrus
/// targets bind the enclosing scope, so comprehensions are descended.
fn collect_walrus(expr: &ast::Expr, out: &mut BTreeSet<String>) {
    match expr {
        ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
            bind_target(target, out);
            collect_walrus(value, out);
        }
        ast::Expr::Lambda(_) => {}
        ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
            for v in values {
                collect_walrus(v, out);
            }
        }
        ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
            collect_walrus(left, out);
            collect_walrus(right, out);
        }
        ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => collect_walrus(operand, out),
        ast::Expr::IfExp(ast::ExprIfExp { test, body, orelse, .. }) => {
            collect_walrus(test, out);
            collect_walrus(body, out);
            collect_walrus(orelse, out);
        }
        ast::Expr::Compare(ast::ExprCompare { left, comparators, .. }) => {
            collect_walrus(left, out);
            for c in comparators {
                collect_walrus(c, out);
            }
        }
        ast::Expr::Call(ast::ExprCall { func, args, keywords, .. }) => {
            collect_walrus(func, out);
            for a in args {
                collect_walrus(a, out);
            }
            for kw in keywords {
                collect_walrus(&kw.value, out);
            }
        }
        ast::Expr::Attribute(ast::ExprAttribute { value, .. })
        | ast::Expr::Starred(ast::ExprStarred { value, .. })
        | ast::Expr::Await(ast::ExprAwait { value, .. })
        | ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => collect_walrus(value, out),
        ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
            collect_walrus(value, out);
            collect_walrus(slice, out);
        }
        ast::Expr::Tuple(ast::ExprTuple { elts, .. })
        | ast::Expr::List(ast::ExprList { elts, .. })
        | ast::Expr::Set(ast::ExprSet { elts, .. }) => {
            for e in elts {
                collect_walrus(e, out);
            }
        }
        ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
            for k in keys.iter().flatten() {
                collect_walrus(k, out);
            }
            for v in values {
                collect_walrus(v, out);
            }
        }
        ast::Expr::ListComp(ast::ExprListComp { elt, generators, .. })
        | ast::Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
        | ast::Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
            collect_walrus(elt, out);
            for g in generators {
                collect_walrus(&g.iter, out);
                for cond in &g.ifs {
                    collect_walrus(cond, out);
                }
            }
        }
        ast::Expr::DictComp(ast::ExprDictComp { key, value, generators, .. }) => {
            collect_walrus(key, out);
            collect_walrus(value, out);
            for g in generators {
                collect_walrus(&g.iter, out);
                for cond in &g.ifs {
                    collect_walrus(cond, out);
                }
            }
        }
        ast::Expr::Slice(ast::ExprSlice { lower, upper, step, .. }) => {
            for part in [lower, upper, step].into_iter().flatten() {
                collect_walrus(part, out);
            }
        }
        _ => {}
    }
}

/// Names captured by a match pattern.
fn bind_pattern(pattern: &ast::Pattern, out: &mut BTreeSet<String>) {
    match pattern {
        ast::Pattern::MatchSequence(p) => {
            for sub in &p.patterns {
                bind_pattern(sub, out);
            }
        }
        ast::Pattern::MatchMapping(p) => {
            for sub in &p.patterns {
                bind_pattern(sub, out);
            }
            if let Some(rest) = &p.rest {
                out.insert(rest.as_str().to_string());
            }
        }
        ast::Pattern::MatchClass(p) => {
            for sub in p.patterns.iter().chain(&p.kwd_patterns) {
                bind_pattern(sub, out);
            }
        }
        ast::Pattern::MatchStar(p) => {
            if let Some(name) = &p.name {
                out.insert(name.as_str().to_string());
            }
        }
        ast::Pattern::MatchAs(p) => {
            if let Some(sub) = &p.pattern {
                bind_pattern(sub, out);
            }
            if let Some(name) = &p.name {
                out.insert(name.as_str().to_string());
            }
        }
        ast::Pattern::MatchOr(p) => {
            for sub in &p.patterns {
                bind_pattern(sub, out);
            }
        }
        _ => {}
    }
}

/// The binding introduced by an import alias, if any.
///
/// `import a.b` binds `a`; `import a.b as c` binds `c`; `from m import *`
/// binds nothing statically.
fn alias_binding(alias: &ast::Alias) -> Option<String> {
    if let Some(asname) = &alias.asname {
        return Some(asname.as_str().to_string());
    }
    let name = alias.name.as_str();
    if name == "*" {
        return None;
    }
    Some(name.split('.').next().unwrap_or(name).to_string())
}

/// Pass 2: load-context name collection with a scope stack.
struct ReadCollector<'a> {
    reads: BTreeSet<String>,
    cell_writes: &'a BTreeSet<String>,
    scopes: Vec<BTreeSet<String>>,
}

impl ReadCollector<'_> {
    fn record(&mut self, name: &str) {
        if self.scopes.iter().any(|scope| scope.contains(name)) {
            return;
        }
        if self.cell_writes.contains(name) || is_builtin(name) {
            return;
        }
        self.reads.insert(name.to_string());
    }

    fn visit_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_expr(value);
                // Subscript/attribute targets read their base object.
                for target in targets {
                    self.visit_expr(target);
                }
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(value);
                self.visit_expr(target);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign { target, annotation, value, .. }) => {
                self.visit_expr(annotation);
                if let Some(value) = value {
                    self.visit_expr(value);
                }
                self.visit_expr(target);
            }
            ast::Stmt::For(ast::StmtFor { target, iter, body, orelse, .. })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor { target, iter, body, orelse, .. }) => {
                self.visit_expr(iter);
                self.visit_expr(target);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::While(ast::StmtWhile { test, body, orelse, .. }) => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::If(ast::StmtIf { test, body, orelse, .. }) => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars);
                    }
                }
                self.visit_body(body);
            }
            ast::Stmt::Try(ast::StmtTry { body, handlers, orelse, finalbody, .. })
            | ast::Stmt::TryStar(ast::StmtTryStar { body, handlers, orelse, finalbody, .. }) => {
                self.visit_body(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.visit_expr(type_);
                    }
                    self.visit_body(&h.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            ast::Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.visit_expr(subject);
                for case in cases {
                    self.visit_pattern(&case.pattern);
                    if let Some(guard) = &case.guard {
                        self.visit_expr(guard);
                    }
                    self.visit_body(&case.body);
                }
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                args, body, decorator_list, returns, ..
            })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                args, body, decorator_list, returns, ..
            }) => {
                for dec in decorator_list {
                    self.visit_expr(dec);
                }
                if let Some(returns) = returns {
                    self.visit_expr(returns);
                }
                self.visit_arg_defaults_and_annotations(args);
                self.enter_function(args, body);
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                bases, keywords, body, decorator_list, ..
            }) => {
                for dec in decorator_list {
                    self.visit_expr(dec);
                }
                for base in bases {
                    self.visit_expr(base);
                }
                for kw in keywords {
                    self.visit_expr(&kw.value);
                }
                // Class bodies are a scope of their own: assignments become
                // class attributes, not cell writes.
                self.scopes.push(collect_bindings(body));
                self.visit_body(body);
                self.scopes.pop();
            }
            ast::Stmt::Return(ast::StmtReturn { value: Some(value), .. }) => {
                self.visit_expr(value);
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                for part in [exc, cause].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.visit_expr(test);
                if let Some(msg) = msg {
                    self.visit_expr(msg);
                }
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => self.visit_expr(value),
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => {
                for target in targets {
                    self.visit_expr(target);
                }
            }
            _ => {}
        }
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Name(name) => {
                if matches!(name.ctx, ast::ExprContext::Load) {
                    self.record(name.id.as_str());
                }
            }
            ast::Expr::Attribute(ast::ExprAttribute { value, .. }) => self.visit_expr(value),
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            ast::Expr::Call(ast::ExprCall { func, args, keywords, .. }) => {
                self.visit_expr(func);
                for arg in args {
                    self.visit_expr(arg);
                }
                for kw in keywords {
                    self.visit_expr(&kw.value);
                }
            }
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
                for v in values {
                    self.visit_expr(v);
                }
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.visit_expr(operand),
            ast::Expr::Compare(ast::ExprCompare { left, comparators, .. }) => {
                self.visit_expr(left);
                for c in comparators {
                    self.visit_expr(c);
                }
            }
            ast::Expr::IfExp(ast::ExprIfExp { test, body, orelse, .. }) => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ast::Expr::NamedExpr(ast::ExprNamedExpr { value, .. }) => {
                // The target is a binding, handled in pass 1.
                self.visit_expr(value);
            }
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.visit_arg_defaults_and_annotations(args);
                let mut locals = BTreeSet::new();
                bind_params(args, &mut locals);
                self.scopes.push(locals);
                self.visit_expr(body);
                self.scopes.pop();
            }
            ast::Expr::ListComp(ast::ExprListComp { elt, generators, .. })
            | ast::Expr::SetComp(ast::ExprSetComp { elt, generators, .. })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp { elt, generators, .. }) => {
                self.visit_comprehension(std::slice::from_ref(elt.as_ref()), generators);
            }
            ast::Expr::DictComp(ast::ExprDictComp { key, value, generators, .. }) => {
                let elts = [key.as_ref().clone(), value.as_ref().clone()];
                self.visit_comprehension(&elts, generators);
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. })
            | ast::Expr::Await(ast::ExprAwait { value, .. })
            | ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => self.visit_expr(value),
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            ast::Expr::Tuple(ast::ExprTuple { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. })
            | ast::Expr::Set(ast::ExprSet { elts, .. }) => {
                for e in elts {
                    self.visit_expr(e);
                }
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for k in keys.iter().flatten() {
                    self.visit_expr(k);
                }
                for v in values {
                    self.visit_expr(v);
                }
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                for v in values {
                    self.visit_expr(v);
                }
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue { value, format_spec, .. }) => {
                self.visit_expr(value);
                if let Some(spec) = format_spec {
                    self.visit_expr(spec);
                }
            }
            ast::Expr::Slice(ast::ExprSlice { lower, upper, step, .. }) => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            _ => {}
        }
    }

    fn visit_pattern(&mut self, pattern: &ast::Pattern) {
        match pattern {
            ast::Pattern::MatchValue(p) => self.visit_expr(&p.value),
            ast::Pattern::MatchSequence(p) => {
                for sub in &p.patterns {
                    self.visit_pattern(sub);
                }
            }
            ast::Pattern::MatchMapping(p) => {
                for key in &p.keys {
                    self.visit_expr(key);
                }
                for sub in &p.patterns {
                    self.visit_pattern(sub);
                }
            }
            ast::Pattern::MatchClass(p) => {
                self.visit_expr(&p.cls);
                for sub in p.patterns.iter().chain(&p.kwd_patterns) {
                    self.visit_pattern(sub);
                }
            }
            ast::Pattern::MatchAs(p) => {
                if let Some(sub) = &p.pattern {
                    self.visit_pattern(sub);
                }
            }
            ast::Pattern::MatchOr(p) => {
                for sub in &p.patterns {
                    self.visit_pattern(sub);
                }
            }
            _ => {}
        }
    }

    /// Defaults and annotations evaluate in the enclosing scope.
    fn visit_arg_defaults_and_annotations(&mut self, args: &ast::Arguments) {
        for arg in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
            if let Some(default) = &arg.default {
                self.visit_expr(default);
            }
            if let Some(annotation) = &arg.def.annotation {
                self.visit_expr(annotation);
            }
        }
        for arg in [&args.vararg, &args.kwarg].into_iter().flatten() {
            if let Some(annotation) = &arg.annotation {
                self.visit_expr(annotation);
            }
        }
    }

    fn enter_function(&mut self, args: &ast::Arguments, body: &[ast::Stmt]) {
        let mut locals = collect_bindings(body);
        bind_params(args, &mut locals);
        self.scopes.push(locals);
        self.visit_body(body);
        self.scopes.pop();
    }

    fn visit_comprehension(&mut self, elts: &[ast::Expr], generators: &[ast::Comprehension]) {
        let Some(first) = generators.first() else {
            return;
        };
        // The first iterable evaluates in the enclosing scope; everything
        // else sees the comprehension's own bindings.
        self.visit_expr(&first.iter);
        self.scopes.push(BTreeSet::new());
        for (index, gen) in generators.iter().enumerate() {
            if index > 0 {
                self.visit_expr(&gen.iter);
            }
            let mut bound = BTreeSet::new();
            bind_target(&gen.target, &mut bound);
            if let Some(scope) = self.scopes.last_mut() {
                scope.extend(bound);
            }
            for cond in &gen.ifs {
                self.visit_expr(cond);
            }
        }
        for elt in elts {
            self.visit_expr(elt);
        }
        self.scopes.pop();
    }
}

fn bind_params(args: &ast::Arguments, out: &mut BTreeSet<String>) {
    for arg in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
        out.insert(arg.def.arg.as_str().to_string());
    }
    for arg in [&args.vararg, &args.kwarg].into_iter().flatten() {
        out.insert(arg.arg.as_str().to_string());
    }
}
