use crate::db::electricity_demand::ElectricityDemandArchive;
use crate::db::rtdb::RtdbConfig;

pub struct ProdDb {}

impl ProdDb {
    pub fn electricity_demand() -> ElectricityDemandArchive {
        ElectricityDemandArchive::new(RtdbConfig::from_env(), "Final 2023.csv")
    }
}
