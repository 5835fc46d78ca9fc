//! Read-only view of the accumulation archive.
//!
//! Understands the common `ar` dialects: GNU (`name/`, `//` long-name table,
//! `/` and `/SYM64/` symbol tables) and BSD (`#1/<len>` inline names,
//! `__.SYMDEF` symbol tables).

use std::path::Path;

use crate::error::{JitError, Result};

const MAGIC: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;

/// Names of the object members stored in the archive at `path`.
///
/// A missing archive has no members.
pub fn members(path: &Path) -> Result<Vec<String>> {
	match std::fs::read(path) {
		Ok(bytes) => parse_members(&bytes),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
		Err(e) => Err(e.into()),
	}
}

/// Parses member names from raw archive bytes.
pub fn parse_members(bytes: &[u8]) -> Result<Vec<String>> {
	let mut rest = bytes
		.strip_prefix(MAGIC)
		.ok_or_else(|| JitError::ArchiveFormat("missing !<arch> magic".into()))?;
	let mut long_names: &[u8] = &[];
	let mut names = Vec::new();

	while !rest.is_empty() {
		if rest.len() < HEADER_LEN {
			return Err(JitError::ArchiveFormat("truncated member header".into()));
		}
		let (header, body) = rest.split_at(HEADER_LEN);
		if &header[58..60] != b"`\n" {
			return Err(JitError::ArchiveFormat("bad member header terminator".into()));
		}
		let size = field(&header[48..58])
			.parse::<usize>()
			.map_err(|_| JitError::ArchiveFormat("bad member size".into()))?;
		if body.len() < size {
			return Err(JitError::ArchiveFormat("truncated member data".into()));
		}
		let data = &body[..size];
		let raw_name = field(&header[..16]);

		match raw_name {
			"/" | "/SYM64/" | "__.SYMDEF" | "__.SYMDEF SORTED" => {}
			"//" => long_names = data,
			name if name.starts_with("#1/") => {
				let len = name[3..]
					.parse::<usize>()
					.map_err(|_| JitError::ArchiveFormat(format!("bad BSD name length in {name}")))?;
				let inline = data
					.get(..len)
					.ok_or_else(|| JitError::ArchiveFormat("BSD name exceeds member".into()))?;
				let inline = String::from_utf8_lossy(inline);
				let inline = inline.trim_end_matches('\0');
				if !inline.starts_with("__.SYMDEF") {
					names.push(inline.to_owned());
				}
			}
			name if name.starts_with('/') => {
				let offset = name[1..]
					.parse::<usize>()
					.map_err(|_| JitError::ArchiveFormat(format!("bad long name reference {name}")))?;
				names.push(long_name(long_names, offset)?);
			}
			name => names.push(name.strip_suffix('/').unwrap_or(name).to_owned()),
		}

		let padded = size + (size & 1);
		rest = body.get(padded..).unwrap_or_default();
	}

	Ok(names)
}

fn field(bytes: &[u8]) -> &str {
	std::str::from_utf8(bytes).unwrap_or_default().trim_end()
}

fn long_name(table: &[u8], offset: usize) -> Result<String> {
	let entry = table
		.get(offset..)
		.ok_or_else(|| JitError::ArchiveFormat(format!("long name offset {offset} out of range")))?;
	let end = entry.iter().position(|b| *b == b'\n').unwrap_or(entry.len());
	let name = String::from_utf8_lossy(&entry[..end]);
	Ok(name.strip_suffix('/').unwrap_or(&name).to_owned())
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn member(name: &str, data: &[u8]) -> Vec<u8> {
		let mut out = format!("{name:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", 0, 0, 0, 644, data.len()).into_bytes();
		out.extend_from_slice(data);
		if data.len() % 2 == 1 {
			out.push(b'\n');
		}
		out
	}

	fn archive(members: &[Vec<u8>]) -> Vec<u8> {
		let mut out = MAGIC.to_vec();
		for m in members {
			out.extend_from_slice(m);
		}
		out
	}

	#[test]
	fn gnu_members_skip_symbol_table() {
		let bytes = archive(&[
			member("/", b"\0\0\0\0"),
			member("k1.co/", b"\x7fELF1"),
			member("k2.co/", b"\x7fELF"),
		]);
		let names = parse_members(&bytes).unwrap();
		assert_eq!(names, vec!["k1.co", "k2.co"]);
	}

	#[test]
	fn gnu_long_names_resolve_through_table() {
		let table = b"k0000000000000001.co/\nk0000000000000002.co/\n";
		let bytes = archive(&[
			member("/", b"\0\0"),
			member("//", table),
			member("/0", b"a"),
			member("/22", b"bb"),
		]);
		assert_eq!(
			parse_members(&bytes).unwrap(),
			vec!["k0000000000000001.co", "k0000000000000002.co"]
		);
	}

	#[test]
	fn bsd_inline_names() {
		let mut data = b"k0000000000000001.co\0\0\0\0".to_vec();
		data.extend_from_slice(b"OBJ");
		let bytes = archive(&[member("#1/20", b"__.SYMDEF\0\0\0\0\0\0\0\0\0\0\0"), member("#1/24", &data)]);
		assert_eq!(parse_members(&bytes).unwrap(), vec!["k0000000000000001.co"]);
	}

	#[test]
	fn rejects_garbage() {
		assert!(matches!(parse_members(b"not an archive"), Err(JitError::ArchiveFormat(_))));
		let mut truncated = archive(&[member("k.co/", b"data")]);
		truncated.truncate(truncated.len() - 2);
		assert!(matches!(parse_members(&truncated), Err(JitError::ArchiveFormat(_))));
	}

	#[test]
	fn missing_archive_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		assert!(members(&dir.path().join("libkiln.a")).unwrap().is_empty());
	}
}
