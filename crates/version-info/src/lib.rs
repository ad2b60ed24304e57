/// The version string reported by `-V`, the overview endpoint and
/// client user agents. Stamped at build time; see build.rs.
pub fn loopdns_version() -> &'static str {
    env!("LOOPDNS_VERSION")
}
