//! Control commands a center receives from the coordinator over the bus
use std::sync::Arc;

use whisper_rpc::bus_client::BusClient;
use whisper_rpc::pack::{cmd, Pack};
use whisper_util::encode::enc;
use whisper_util::error::Error;

use crate::server::CenterServer;

pub const CMD_MED_CONNECT_OTHER_CENTER: &str = "connect-2-other-center";
pub const CMD_MED_SET_MASTER: &str = "set-master";
pub const CMD_MED_NEW_DATA: &str = "new-data";
pub const CMD_MED_PERSIST_DATA: &str = "persist-data";
pub const CMD_MED_DATA_INFO: &str = "data-info";

impl CenterServer {
	/// Connect to the coordination bus, install the control handlers, and
	/// declare this center's logical host so the coordinator can notify it
	/// by address. `mediator_addr` is a full host:port.
	pub async fn let_mediate(
		self: &Arc<Self>,
		mediator_addr: &str,
	) -> Result<Arc<BusClient>, Error> {
		let bus = BusClient::connect(mediator_addr).await?;
		info!("center server mediator client started");

		let this = self.clone();
		bus.add_handler(CMD_MED_NEW_DATA, move |pack: Pack| {
			let this = this.clone();
			async move {
				let dir = String::from_utf8_lossy(&pack.body).into_owned();
				match this.center.new_index(&dir).await {
					Ok(id) => {
						let mut r = Pack::ok(CMD_MED_NEW_DATA);
						r.body = id.to_string().into_bytes();
						r
					}
					Err(e) => Pack::failure(CMD_MED_NEW_DATA, e.to_string()),
				}
			}
		})
		.await;

		let this = self.clone();
		bus.add_handler(CMD_MED_DATA_INFO, move |_pack: Pack| {
			let this = this.clone();
			async move {
				let counts = this.center.record_counts().await;
				match enc(&counts) {
					Ok(body) => {
						let mut r = Pack::ok(CMD_MED_DATA_INFO);
						r.body = body;
						r
					}
					Err(e) => Pack::failure(CMD_MED_DATA_INFO, e.to_string()),
				}
			}
		})
		.await;

		let this = self.clone();
		bus.add_handler(CMD_MED_PERSIST_DATA, move |_pack: Pack| {
			let this = this.clone();
			async move {
				match this.center.persist().await {
					Ok(()) => Pack::ok(CMD_MED_PERSIST_DATA),
					Err(e) => Pack::failure(CMD_MED_PERSIST_DATA, e.to_string()),
				}
			}
		})
		.await;

		let this = self.clone();
		bus.add_handler(CMD_MED_SET_MASTER, move |pack: Pack| {
			let this = this.clone();
			async move {
				let is_master = pack.body == b"true";
				this.set_master(is_master).await;
				Pack::no_return()
			}
		})
		.await;

		let this = self.clone();
		bus.add_handler(CMD_MED_CONNECT_OTHER_CENTER, move |pack: Pack| {
			let this = this.clone();
			async move {
				let addr = String::from_utf8_lossy(&pack.body).into_owned();
				if let Err(e) = this.connect_to_other(&addr).await {
					error!("center server connect to other error - {}", e);
				}
				Pack::no_return()
			}
		})
		.await;

		bus.send(&Pack::with_body(
			cmd::MAPPING_HOST,
			self.host.clone().into_bytes(),
		))
		.await?;

		Ok(bus)
	}
}
