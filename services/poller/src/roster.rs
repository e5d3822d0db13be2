//! Device roster access.
//!
//! Devices are created and removed externally; the poller only reads the
//! `devices` table and reconciles its loops against it on a periodic sweep.

use af_device::DeviceTarget;
use sqlx::PgPool;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceRecord {
    pub device_id: i64,
    pub address: String,
    pub username: String,
    pub secret: String,
    pub display_name: Option<String>,
}

impl DeviceRecord {
    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            address: self.address.clone(),
            username: self.username.clone(),
            secret: self.secret.clone(),
        }
    }
}

pub async fn load_devices(pool: &PgPool) -> Result<Vec<DeviceRecord>, sqlx::Error> {
    sqlx::query_as::<_, DeviceRecord>(
        "SELECT device_id, address, username, secret, display_name
         FROM devices
         ORDER BY device_id",
    )
    .fetch_all(pool)
    .await
}
