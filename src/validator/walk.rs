//! AST traversal helpers: fact collection for the allowlist checks and
//! wildcard expansion for the sanitized form.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, GroupByExpr, Ident, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, visit_expressions, visit_relations,
};

use crate::catalog::SchemaCatalog;

/// One relation reference (FROM, JOIN, subquery, CTE source).
#[derive(Debug, Clone)]
pub(super) struct RelationRef {
    pub schema: Option<String>,
    pub table: String,
}

impl RelationRef {
    pub fn render(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

/// One column reference, optionally qualified.
#[derive(Debug, Clone)]
pub(super) struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn render(&self) -> String {
        match &self.qualifier {
            Some(qualifier) => format!("{qualifier}.{}", self.column),
            None => self.column.clone(),
        }
    }
}

/// Everything the checks need to know about one statement. All names are
/// lowercased.
#[derive(Debug, Default)]
pub(super) struct StatementFacts {
    pub relations: Vec<RelationRef>,
    pub cte_names: BTreeSet<String>,
    /// alias or bare table name -> base table.
    pub alias_map: BTreeMap<String, String>,
    pub derived_aliases: BTreeSet<String>,
    pub projection_aliases: BTreeSet<String>,
    pub column_refs: Vec<ColumnRef>,
    pub functions: BTreeSet<String>,
    pub table_functions: BTreeSet<String>,
    pub unsupported_factors: Vec<String>,
    pub has_group_by: bool,
}

impl StatementFacts {
    /// Base-table scans, CTE references excluded.
    pub fn relation_count(&self) -> usize {
        self.relations
            .iter()
            .filter(|r| !self.cte_names.contains(&r.table))
            .count()
    }

    pub fn base_tables(&self) -> BTreeSet<String> {
        self.relations
            .iter()
            .filter(|r| !self.cte_names.contains(&r.table))
            .map(|r| r.table.clone())
            .collect()
    }
}

fn lower(ident: &Ident) -> String {
    ident.value.to_ascii_lowercase()
}

fn relation_from(name: &ObjectName) -> RelationRef {
    let parts = &name.0;
    match parts.len() {
        0 => RelationRef {
            schema: None,
            table: String::new(),
        },
        1 => RelationRef {
            schema: None,
            table: lower(&parts[0]),
        },
        n => RelationRef {
            schema: Some(lower(&parts[n - 2])),
            table: lower(&parts[n - 1]),
        },
    }
}

/// Collect facts for the allowlist, pattern, and cost checks.
pub(super) fn collect(statement: &Statement) -> StatementFacts {
    let mut facts = StatementFacts::default();

    let _ = visit_relations(statement, |name: &ObjectName| {
        facts.relations.push(relation_from(name));
        ControlFlow::<()>::Continue(())
    });

    let mut column_refs = Vec::new();
    let mut functions = BTreeSet::new();
    let _ = visit_expressions(statement, |expr: &Expr| {
        match expr {
            Expr::Identifier(ident) => column_refs.push(ColumnRef {
                qualifier: None,
                column: lower(ident),
            }),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                column_refs.push(ColumnRef {
                    qualifier: Some(lower(&parts[parts.len() - 2])),
                    column: lower(&parts[parts.len() - 1]),
                });
            }
            Expr::Function(function) => {
                if let Some(last) = function.name.0.last() {
                    functions.insert(lower(last));
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    facts.column_refs = column_refs;
    facts.functions = functions;

    if let Statement::Query(query) = statement {
        walk_query(query, &mut facts);
    }
    facts
}

fn walk_query(query: &Query, facts: &mut StatementFacts) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            facts.cte_names.insert(lower(&cte.alias.name));
            walk_query(&cte.query, facts);
        }
    }
    walk_set_expr(&query.body, facts);
}

fn walk_set_expr(body: &SetExpr, facts: &mut StatementFacts) {
    match body {
        SetExpr::Select(select) => walk_select(select, facts),
        SetExpr::Query(query) => walk_query(query, facts),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, facts);
            walk_set_expr(right, facts);
        }
        _ => {}
    }
}

fn walk_select(select: &Select, facts: &mut StatementFacts) {
    for item in &select.projection {
        if let SelectItem::ExprWithAlias { alias, .. } = item {
            facts.projection_aliases.insert(lower(alias));
        }
    }
    if let GroupByExpr::Expressions(exprs) = &select.group_by
        && !exprs.is_empty()
    {
        facts.has_group_by = true;
    }
    for table_with_joins in &select.from {
        walk_factor(&table_with_joins.relation, facts);
        for join in &table_with_joins.joins {
            walk_factor(&join.relation, facts);
        }
    }
}

fn walk_factor(factor: &TableFactor, facts: &mut StatementFacts) {
    match factor {
        TableFactor::Table {
            name, alias, args, ..
        } => {
            if args.is_some() {
                if let Some(last) = name.0.last() {
                    facts.table_functions.insert(lower(last));
                }
                return;
            }
            let relation = relation_from(name);
            let key = alias
                .as_ref()
                .map(|a| lower(&a.name))
                .unwrap_or_else(|| relation.table.clone());
            facts.alias_map.insert(key, relation.table.clone());
            facts
                .alias_map
                .entry(relation.table.clone())
                .or_insert_with(|| relation.table.clone());
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            if let Some(alias) = alias {
                facts.derived_aliases.insert(lower(&alias.name));
            }
            walk_query(subquery, facts);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_factor(&table_with_joins.relation, facts);
            for join in &table_with_joins.joins {
                walk_factor(&join.relation, facts);
            }
        }
        other => {
            facts.unsupported_factors.push(other.to_string());
        }
    }
}

/// Rewrite `*` and `alias.*` to explicit column lists wherever the local
/// scope is entirely catalog tables. Wildcards over derived scopes are left
/// alone: their columns come from an already-validated subquery.
pub(super) fn expand_wildcards(query: &mut Query, catalog: &SchemaCatalog) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            expand_wildcards(&mut cte.query, catalog);
        }
    }
    expand_in_set_expr(&mut query.body, catalog);
}

fn expand_in_set_expr(body: &mut SetExpr, catalog: &SchemaCatalog) {
    match body {
        SetExpr::Select(select) => expand_in_select(select, catalog),
        SetExpr::Query(query) => expand_wildcards(query, catalog),
        SetExpr::SetOperation { left, right, .. } => {
            expand_in_set_expr(left, catalog);
            expand_in_set_expr(right, catalog);
        }
        _ => {}
    }
}

fn expand_in_select(select: &mut Select, catalog: &SchemaCatalog) {
    for table_with_joins in &mut select.from {
        expand_in_factor(&mut table_with_joins.relation, catalog);
        for join in &mut table_with_joins.joins {
            expand_in_factor(&mut join.relation, catalog);
        }
    }

    // Local scope: (reference key, catalog table) in FROM order. `None`
    // marks a factor whose columns the catalog cannot enumerate.
    let mut scope: Vec<Option<(String, String)>> = Vec::new();
    for table_with_joins in &select.from {
        scope.push(scope_entry(&table_with_joins.relation, catalog));
        for join in &table_with_joins.joins {
            scope.push(scope_entry(&join.relation, catalog));
        }
    }
    let fully_known = !scope.is_empty() && scope.iter().all(Option::is_some);
    let multi_table = scope.len() > 1;

    let items: Vec<SelectItem> = select.projection.drain(..).collect();
    for item in items {
        match item {
            SelectItem::Wildcard(options) => {
                if fully_known {
                    for entry in scope.iter().flatten() {
                        push_columns(&mut select.projection, entry, multi_table, catalog);
                    }
                } else {
                    select.projection.push(SelectItem::Wildcard(options));
                }
            }
            SelectItem::QualifiedWildcard(name, options) => {
                let key = name
                    .0
                    .last()
                    .map(lower)
                    .unwrap_or_default();
                let resolved = scope
                    .iter()
                    .flatten()
                    .find(|(k, _)| *k == key)
                    .cloned();
                match resolved {
                    Some(entry) => {
                        push_columns(&mut select.projection, &entry, true, catalog);
                    }
                    None => select
                        .projection
                        .push(SelectItem::QualifiedWildcard(name, options)),
                }
            }
            other => select.projection.push(other),
        }
    }
}

fn expand_in_factor(factor: &mut TableFactor, catalog: &SchemaCatalog) {
    match factor {
        TableFactor::Derived { subquery, .. } => expand_wildcards(subquery, catalog),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            expand_in_factor(&mut table_with_joins.relation, catalog);
            for join in &mut table_with_joins.joins {
                expand_in_factor(&mut join.relation, catalog);
            }
        }
        _ => {}
    }
}

fn scope_entry(factor: &TableFactor, catalog: &SchemaCatalog) -> Option<(String, String)> {
    match factor {
        TableFactor::Table {
            name,
            alias,
            args: None,
            ..
        } => {
            let relation = relation_from(name);
            if catalog.is_table_allowed(&relation.table) {
                let key = alias
                    .as_ref()
                    .map(|a| lower(&a.name))
                    .unwrap_or_else(|| relation.table.clone());
                Some((key, relation.table))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn push_columns(
    projection: &mut Vec<SelectItem>,
    (key, table): &(String, String),
    qualified: bool,
    catalog: &SchemaCatalog,
) {
    let Some(spec) = catalog.table(table) else {
        return;
    };
    for column in spec.column_names() {
        let expr = if qualified {
            Expr::CompoundIdentifier(vec![Ident::new(key.clone()), Ident::new(column)])
        } else {
            Expr::Identifier(Ident::new(column))
        };
        projection.push(SelectItem::UnnamedExpr(expr));
    }
}
