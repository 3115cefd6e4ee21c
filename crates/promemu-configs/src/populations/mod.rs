pub mod hosts_load_with_peaks;
pub mod single_host_load;
