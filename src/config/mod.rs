mod config;

pub use config::{
    CampaignSettings, GatewaySettings, HttpSettings, PartitionSettings, PostgresSettings,
    QueueSettings, Settings, SnapshotSettings,
};
