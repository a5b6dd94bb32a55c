//! Wire types shared by the coordination bus and the operator tunnel
use serde::{Deserialize, Serialize};

use whisper_util::data::SP;
use whisper_util::encode::{dec, enc};
use whisper_util::error::Error;

/// Bus command codes. The wire names are stable, do not renumber.
pub mod cmd {
	/// Keep-alive probe, server to client
	pub const CHECK_ALIVE: &str = "?";
	/// Keep-alive reply carrying the client unix seconds
	pub const REPLY_ALIVE: &str = "!";
	/// Pseudo-command marking "no reply to send"
	pub const NO_RETURN: &str = "0";
	/// Shut the whole server down
	pub const CLOSE: &str = "-1";
	/// Voluntary disconnect
	pub const QUIT: &str = "100";
	pub const ADD_WATCHER_DONE: &str = "200";
	pub const TRIGGER_WATCHER: &str = "201";
	pub const REGISTER_WATCHER: &str = "202";
	pub const MAPPING_HOST: &str = "300";
	/// Operator tunnel: body parses into one of pub|notify|tri
	pub const DO_NOTIFY: &str = "400";
}

/// The message unit of the coordination bus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pack {
	pub command: String,
	#[serde(with = "serde_bytes")]
	pub body: Vec<u8>,
	pub flag: bool,
	pub msg: String,
}

impl Pack {
	pub fn new(command: &str) -> Self {
		Pack {
			command: command.to_string(),
			..Default::default()
		}
	}

	pub fn with_body(command: &str, body: Vec<u8>) -> Self {
		Pack {
			command: command.to_string(),
			body,
			..Default::default()
		}
	}

	pub fn ok(command: &str) -> Self {
		Pack {
			command: command.to_string(),
			flag: true,
			..Default::default()
		}
	}

	pub fn failure(command: &str, msg: String) -> Self {
		Pack {
			command: command.to_string(),
			flag: false,
			msg,
			..Default::default()
		}
	}

	pub fn no_return() -> Self {
		Pack::new(cmd::NO_RETURN)
	}

	pub fn is_no_return(&self) -> bool {
		self.command == cmd::NO_RETURN
	}
}

/// Group whose semantics are "deliver to any one subscriber"
pub const WATCHER_GROUP_ALL: &str = "all";

/// Delimiter internal to an encoded Trigger. The generic encoder is not
/// reliable for nested byte slices, so triggers carry their own framing.
pub const SP_TRI: &[u8] = &[b'|', b'|'];

/// Watcher push payload: a new value and the value it replaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
	pub group: String,
	pub key: String,
	pub value: Vec<u8>,
	pub value_old: Vec<u8>,
}

pub fn enc_tri(t: &Trigger) -> Vec<u8> {
	let mut b = Vec::with_capacity(
		t.group.len() + t.key.len() + t.value.len() + t.value_old.len() + 3 * SP_TRI.len(),
	);
	b.extend_from_slice(t.group.as_bytes());
	b.extend_from_slice(SP_TRI);
	b.extend_from_slice(t.key.as_bytes());
	b.extend_from_slice(SP_TRI);
	b.extend_from_slice(&t.value);
	b.extend_from_slice(SP_TRI);
	b.extend_from_slice(&t.value_old);
	b
}

pub fn dec_tri(b: &[u8]) -> Result<Trigger, Error> {
	let arr = whisper_util::data::split_on(b, SP_TRI);
	if arr.len() != 4 {
		return Err(Error::Message(format!(
			"decode trigger error, expected 4 parts, got {}",
			arr.len()
		)));
	}
	Ok(Trigger {
		group: String::from_utf8_lossy(arr[0]).into_owned(),
		key: String::from_utf8_lossy(arr[1]).into_owned(),
		value: arr[2].to_vec(),
		value_old: arr[3].to_vec(),
	})
}

/// Encode a pack and terminate it with the bus frame delimiter
pub fn frame_pack(pack: &Pack) -> Result<Vec<u8>, Error> {
	let mut body = enc(pack)?;
	body.extend_from_slice(whisper_util::data::CL);
	Ok(body)
}

pub fn decode_pack(frame: &[u8]) -> Result<Pack, Error> {
	dec(frame)
}

// ---- DO_NOTIFY body builders ----

fn join_sp(parts: &[&[u8]]) -> Vec<u8> {
	let mut buf = Vec::new();
	for (i, p) in parts.iter().enumerate() {
		if i > 0 {
			buf.extend_from_slice(SP);
		}
		buf.extend_from_slice(p);
	}
	buf
}

/// `pub, cmd, body` - broadcast to all connections
pub fn notify_body_pub(command: &str, body: &[u8]) -> Vec<u8> {
	join_sp(&[b"pub", command.as_bytes(), body])
}

/// `notify, remoteAddr, cmd, body` - unicast
pub fn notify_body_notify(remote_addr: &str, command: &str, body: &[u8]) -> Vec<u8> {
	join_sp(&[b"notify", remote_addr.as_bytes(), command.as_bytes(), body])
}

/// `tri, group, key, value, valueOld` - trigger the watcher bus
pub fn notify_body_tri(group: &str, key: &str, value: &[u8], value_old: &[u8]) -> Vec<u8> {
	join_sp(&[b"tri", group.as_bytes(), key.as_bytes(), value, value_old])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_pack_roundtrip() {
		let p = Pack {
			command: cmd::REGISTER_WATCHER.to_string(),
			body: b"all,block-refresh".to_vec(),
			flag: true,
			msg: String::new(),
		};
		let framed = frame_pack(&p).unwrap();
		assert!(framed.ends_with(whisper_util::data::CL));
		let p2 = decode_pack(&framed[..framed.len() - 2]).unwrap();
		assert_eq!(p2.command, p.command);
		assert_eq!(p2.body, p.body);
		assert!(p2.flag);
	}

	#[test]
	fn test_trigger_roundtrip() {
		let t = Trigger {
			group: "named".into(),
			key: "block-refresh".into(),
			value: vec![1, 2, 3],
			value_old: vec![],
		};
		let t2 = dec_tri(&enc_tri(&t)).unwrap();
		assert_eq!(t, t2);
	}

	#[test]
	fn test_trigger_bad_parts() {
		assert!(dec_tri(b"only||three||parts").is_err());
	}

	#[test]
	fn test_notify_bodies() {
		use whisper_util::data::{split_on, SP};

		let body = notify_body_pub("201", b"xyz");
		assert_eq!(split_on(&body, SP).len(), 3);

		let body = notify_body_notify("127.0.0.1:9770", "set-master", b"true");
		assert_eq!(split_on(&body, SP).len(), 4);

		let body = notify_body_tri("all", "block-refresh", b"new", b"old");
		let parts = split_on(&body, SP);
		assert_eq!(parts.len(), 5);
		assert_eq!(parts[0], b"tri");
		assert_eq!(parts[4], b"old");
	}
}
