pub mod fs;
pub mod paths;

/// Discover the number of processors.
///
/// On Unix, counts `processor : N` lines in /proc/cpuinfo where N equals the
/// running count; elsewhere the NUMBER_OF_PROCESSORS environment variable is
/// consulted. Never returns less than 1.
pub fn detect_processors() -> usize {
    let mut n = detect_processors_impl();
    if n < 1 {
        n = 1;
    }
    n
}

#[cfg(unix)]
fn detect_processors_impl() -> usize {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return 1;
    };
    let mut count = 0usize;
    for line in cpuinfo.lines() {
        let compact: String = line
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if let Some(num) = compact.strip_prefix("processor:") {
            if num.parse::<usize>() == Ok(count) {
                count += 1;
            }
        }
    }
    count
}

#[cfg(not(unix))]
fn detect_processors_impl() -> usize {
    std::env::var("NUMBER_OF_PROCESSORS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_processor() {
        assert!(detect_processors() >= 1);
    }
}
