use crate::languages::slice;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tree_sitter::{Language, Node, Parser, Point, TreeCursor};

static CPP_LANGUAGE: Lazy<Language> = Lazy::new(|| tree_sitter_cpp::LANGUAGE.into());

/// A declaration found in a C/C++ file. Positions are 1-based, columns in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CppSymbol {
    pub name: String,
    pub kind: &'static str,
    pub container: Option<String>,
    pub namespace: Vec<String>,
    /// Position of the name token.
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
    /// Full extent of the declaration.
    pub start_line: u32,
    pub last_line: u32,
    pub signature: Option<String>,
    pub bases: Vec<String>,
    pub is_definition: bool,
}

impl CppSymbol {
    pub fn qualified_name(&self) -> String {
        let mut parts = self.namespace.clone();
        if let Some(container) = &self.container {
            parts.push(container.clone());
        }
        parts.push(self.name.clone());
        parts.join("::")
    }

    fn name_contains(&self, line: u32, column: u32) -> bool {
        line == self.line && column >= self.column && column < self.end_column.max(self.column + 1)
    }

    fn extent_contains(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.last_line
    }
}

/// Parse a C/C++ source and list its declarations in document order.
///
/// Parsing is error-tolerant; code that does not compile still yields symbols.
pub fn parse_symbols(source: &str) -> Result<Vec<CppSymbol>> {
    let mut parser = Parser::new();
    parser
        .set_language(&CPP_LANGUAGE)
        .context("failed to set C++ language")?;
    let tree = parser
        .parse(source, None)
        .context("failed to parse C++ file")?;

    let mut symbols = Vec::new();
    let mut cursor = tree.walk();
    walk_symbols(source, &mut cursor, None, &[], &mut symbols);
    Ok(symbols)
}

/// The declaration at a 1-based position: the symbol whose name is under the
/// cursor, otherwise the innermost function whose body spans the line.
pub fn symbol_at(symbols: &[CppSymbol], line: u32, column: u32) -> Option<&CppSymbol> {
    if let Some(hit) = symbols.iter().find(|s| s.name_contains(line, column)) {
        return Some(hit);
    }
    symbols
        .iter()
        .filter(|s| s.signature.is_some() && s.extent_contains(line))
        .min_by_key(|s| s.last_line - s.start_line)
}

fn walk_symbols(
    source: &str,
    cursor: &mut TreeCursor,
    container: Option<String>,
    namespace_path: &[String],
    symbols: &mut Vec<CppSymbol>,
) {
    loop {
        let node = cursor.node();
        match node.kind() {
            "function_definition" | "declaration" | "field_declaration" => {
                if let Some(function) = find_function_declarator(&node) {
                    if let Some((name, scope)) = extract_function_name(source, &function) {
                        let owner = scope.or_else(|| container.clone());
                        let kind = match &owner {
                            Some(owner) if *owner == name => "constructor",
                            Some(_) => "method",
                            None => "function",
                        };
                        let name_node = function
                            .child_by_field_name("declarator")
                            .map(|n| unqualified(&n))
                            .unwrap_or(function);
                        symbols.push(make_symbol(
                            &node,
                            &name_node,
                            name,
                            kind,
                            owner,
                            namespace_path,
                            Some(signature_text(source, &node)),
                            node.kind() == "function_definition",
                        ));
                    }
                } else if node.kind() == "field_declaration" && container.is_some() {
                    if let Some(declarator) = node.child_by_field_name("declarator") {
                        let name_node = innermost_identifier(&declarator).unwrap_or(declarator);
                        let name = slice(source, &name_node);
                        if !name.is_empty() {
                            symbols.push(make_symbol(
                                &node,
                                &name_node,
                                name,
                                "field",
                                container.clone(),
                                namespace_path,
                                None,
                                true,
                            ));
                        }
                    }
                }
            }
            "class_specifier" | "struct_specifier" => {
                let kind = if node.kind() == "class_specifier" {
                    "class"
                } else {
                    "struct"
                };
                let name_node = node.child_by_field_name("name");
                let name = name_node.map(|n| slice(source, &n)).unwrap_or_default();
                let has_body = node.child_by_field_name("body").is_some();
                if let (Some(name_node), false, true) = (name_node, name.is_empty(), has_body) {
                    let mut sym = make_symbol(
                        &node,
                        &name_node,
                        name.clone(),
                        kind,
                        container.clone(),
                        namespace_path,
                        None,
                        true,
                    );
                    sym.bases = base_classes(source, &node);
                    symbols.push(sym);

                    // members get the class as container
                    if cursor.goto_first_child() {
                        walk_symbols(source, cursor, Some(name), namespace_path, symbols);
                        cursor.goto_parent();
                    }
                    if cursor.goto_next_sibling() {
                        continue;
                    } else {
                        break;
                    }
                }
            }
            "enum_specifier" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let name = slice(source, &name_node);
                    if !name.is_empty() {
                        symbols.push(make_symbol(
                            &node,
                            &name_node,
                            name,
                            "enum",
                            container.clone(),
                            namespace_path,
                            None,
                            true,
                        ));
                    }
                }
            }
            "type_definition" | "alias_declaration" => {
                let name_node = node
                    .child_by_field_name("name")
                    .or_else(|| node.child_by_field_name("declarator"));
                if let Some(name_node) = name_node {
                    let name = slice(source, &name_node);
                    if !name.is_empty() {
                        symbols.push(make_symbol(
                            &node,
                            &name_node,
                            name,
                            "type",
                            container.clone(),
                            namespace_path,
                            None,
                            true,
                        ));
                    }
                }
            }
            "namespace_definition" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let name = slice(source, &name_node);
                    if !name.is_empty() {
                        symbols.push(make_symbol(
                            &node,
                            &name_node,
                            name.clone(),
                            "namespace",
                            None,
                            namespace_path,
                            None,
                            true,
                        ));
                        let mut ns_path = namespace_path.to_vec();
                        ns_path.push(name);
                        if cursor.goto_first_child() {
                            walk_symbols(source, cursor, container.clone(), &ns_path, symbols);
                            cursor.goto_parent();
                        }
                        if cursor.goto_next_sibling() {
                            continue;
                        } else {
                            break;
                        }
                    }
                }
            }
            _ => {}
        }

        // function bodies hold no declarations worth listing
        if node.kind() != "function_definition" && cursor.goto_first_child() {
            walk_symbols(source, cursor, container.clone(), namespace_path, symbols);
            cursor.goto_parent();
        }

        if !cursor.goto_next_sibling() {
            break;
        }
    }
}

/// Look through pointer/reference wrappers for the function declarator.
fn find_function_declarator<'a>(node: &Node<'a>) -> Option<Node<'a>> {
    let mut current = node.child_by_field_name("declarator")?;
    for _ in 0..8 {
        match current.kind() {
            "function_declarator" => return Some(current),
            "pointer_declarator" | "reference_declarator" | "parenthesized_declarator" => {
                let inner = match current.child_by_field_name("declarator") {
                    Some(inner) => inner,
                    None => current.named_child(current.named_child_count().checked_sub(1)?)?,
                };
                current = inner;
            }
            _ => return None,
        }
    }
    None
}

/// `a::b::name` -> the `name` node.
fn unqualified<'a>(node: &Node<'a>) -> Node<'a> {
    let mut current = *node;
    while current.kind() == "qualified_identifier" {
        match current.child_by_field_name("name") {
            Some(name) => current = name,
            None => break,
        }
    }
    current
}

fn innermost_identifier<'a>(node: &Node<'a>) -> Option<Node<'a>> {
    if matches!(node.kind(), "identifier" | "field_identifier") {
        return Some(*node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'a>> = node.named_children(&mut cursor).collect();
    children.iter().find_map(innermost_identifier)
}

/// Name and, for `Scope::name` declarators, the enclosing scope.
fn extract_function_name(source: &str, declarator: &Node) -> Option<(String, Option<String>)> {
    let name_node = declarator.child_by_field_name("declarator")?;
    let name = slice(source, &name_node);
    if name.is_empty() {
        return None;
    }
    if !name.contains("::") {
        return Some((name, None));
    }
    let (scope, member) = name.rsplit_once("::")?;
    let scope = scope.rsplit("::").next().unwrap_or(scope);
    // strip template arguments: Box<T>::get
    let scope = scope.split('<').next().unwrap_or(scope).trim();
    Some((
        member.to_string(),
        (!scope.is_empty()).then(|| scope.to_string()),
    ))
}

/// Declaration text up to the body, whitespace collapsed.
fn signature_text(source: &str, node: &Node) -> String {
    let end = node
        .child_by_field_name("body")
        .map(|body| body.start_byte())
        .unwrap_or_else(|| node.end_byte());
    let text = source.get(node.start_byte()..end).unwrap_or_default();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    text.trim_end_matches(';').trim().to_string()
}

fn base_classes(source: &str, node: &Node) -> Vec<String> {
    let mut bases = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() != "base_class_clause" {
            continue;
        }
        let mut inner = child.walk();
        for base in child.children(&mut inner) {
            match base.kind() {
                "type_identifier" | "qualified_identifier" | "template_type" => {
                    let name = slice(source, &base);
                    if !name.is_empty() {
                        bases.push(name);
                    }
                }
                "base_class_specifier" => {
                    let mut spec = base.walk();
                    if let Some(ty) = base.children(&mut spec).find(|c| {
                        matches!(
                            c.kind(),
                            "type_identifier" | "qualified_identifier" | "template_type"
                        )
                    }) {
                        bases.push(slice(source, &ty));
                    };
                }
                _ => {}
            }
        }
    }
    bases
}

fn one_based(point: Point) -> (u32, u32) {
    (point.row as u32 + 1, point.column as u32 + 1)
}

#[allow(clippy::too_many_arguments)]
fn make_symbol(
    node: &Node,
    name_node: &Node,
    name: String,
    kind: &'static str,
    container: Option<String>,
    namespace_path: &[String],
    signature: Option<String>,
    is_definition: bool,
) -> CppSymbol {
    let (line, column) = one_based(name_node.start_position());
    let (end_line, end_column) = one_based(name_node.end_position());
    let (start_line, _) = one_based(node.start_position());
    let (last_line, _) = one_based(node.end_position());
    CppSymbol {
        name,
        kind,
        container,
        namespace: namespace_path.to_vec(),
        line,
        column,
        end_line,
        end_column,
        start_line,
        last_line,
        signature,
        bases: Vec::new(),
        is_definition,
    }
}
