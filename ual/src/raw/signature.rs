use std::cmp::Ordering;

use crate::errors::LoadError;

/// A parsed `"<ret> <class>::<name>(<arg>,...)"` method signature. Borrows
/// nothing: every field is owned, since signatures are interned into maps
/// keyed by their own text and often outlive the module's raw bytes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MethodSignature {
	pub full_text: String,
	pub return_type: String,
	pub class_name: String,
	pub method_name: String,
	pub args: Vec<String>,
}

impl MethodSignature {
	/// Parses `"<ret> <cls>::<name>(<a0>,<a1>,...)"`. An empty argument list
	/// (`()`) is a zero-argument method, not a single empty-string argument.
	pub fn parse(text: &str) -> Result<Self, LoadError> {
		let full_text = text.to_string();
		let rest = text.trim_start();

		let (return_type, rest) = split_once_whitespace(rest).ok_or_else(|| LoadError::BadSignature(full_text.clone()))?;
		let rest = rest.trim_start();

		let (class_name, rest) = rest.split_once("::").ok_or_else(|| LoadError::BadSignature(full_text.clone()))?;

		let paren = rest.find('(').ok_or_else(|| LoadError::BadSignature(full_text.clone()))?;
		let method_name = &rest[..paren];
		let rest = &rest[paren + 1..];
		let close = rest.find(')').ok_or_else(|| LoadError::BadSignature(full_text.clone()))?;
		let args_text = &rest[..close];

		let args = if args_text.trim().is_empty() {
			Vec::new()
		} else {
			args_text.split(',').map(|arg| arg.trim().to_string()).collect()
		};

		Ok(MethodSignature {
			full_text,
			return_type: return_type.to_string(),
			class_name: class_name.to_string(),
			method_name: method_name.to_string(),
			args,
		})
	}
}

impl Ord for MethodSignature {
	fn cmp(&self, other: &Self) -> Ordering {
		self.full_text.cmp(&other.full_text)
	}
}

impl PartialOrd for MethodSignature {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

fn split_once_whitespace(text: &str) -> Option<(&str, &str)> {
	let idx = text.find(char::is_whitespace)?;
	Some((&text[..idx], &text[idx + 1..]))
}
