//! Requests the master sends over its link to this node.

use tierfs_core::Connection;
use tierfs_proto::constants::FRAME_STAT_OK;
use tierfs_proto::msg::{self, FreeSpace};
use tierfs_proto::{Command, Frame, FsResult, Role};

use crate::daemon::SharedSys;

pub async fn handle(sys: &SharedSys, conn: &Connection, req: Frame) -> FsResult<()> {
    match req.cmd {
        Command::MaxFreeSpace => {
            let payload = msg::encode(&FreeSpace {
                max_free: sys.hot.max_free_space(),
            })?;
            conn.send_response(&req, FRAME_STAT_OK, payload).await
        }
        cmd => Err(super::unsupported(Role::Master, cmd)),
    }
}
