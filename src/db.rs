pub mod electricity_demand;
pub mod prod_db;
pub mod rtdb;
