pub mod cpp;

use tree_sitter::Node;

/// Extract the text content of a tree-sitter node from source code.
pub fn slice(source: &str, node: &Node) -> String {
    let bytes = node.byte_range();
    source.get(bytes).unwrap_or_default().trim().to_string()
}
