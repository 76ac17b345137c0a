use indexmap::IndexSet;

fn compatibility(tags: &IndexSet<String>, tag: &str) -> Option<i32> {
    tags.get_index_of(tag).map(|score| -(score as i32))
}

pub trait Platform {
    fn tags(&self) -> indexmap::set::Iter<'_, String>;

    fn compatibility(&self, tag: &str) -> Option<i32>;

    fn max_compatibility<T, S>(&self, tags: T) -> Option<i32>
    where
        T: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter()
            .filter_map(|t| self.compatibility(t.as_ref()))
            .max()
    }
}

/// The set of wheel compatibility tags accepted for a resolve, most-preferred
/// first. Built directly from `Environment::compatible_tags` -- we never probe
/// the local machine, since a resolve has to be reproducible against a target
/// environment that may not be the one running the resolver.
#[derive(Debug, Clone)]
pub struct WheelPlatform {
    tags: IndexSet<String>,
}

impl WheelPlatform {
    pub fn new<I, S>(compatible_tags: I) -> WheelPlatform
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WheelPlatform {
            tags: compatible_tags.into_iter().map(Into::into).collect(),
        }
    }
}

impl Platform for WheelPlatform {
    fn tags(&self) -> indexmap::set::Iter<'_, String> {
        self.tags.iter()
    }

    fn compatibility(&self, tag: &str) -> Option<i32> {
        compatibility(&self.tags, tag)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wheel_platform_compatibility() {
        let platform = WheelPlatform::new(["cp311-cp311-manylinux_2_17_x86_64", "py3-none-any"]);
        assert!(platform.compatibility("cp311-cp311-manylinux_2_17_x86_64").is_some());
        assert!(platform.compatibility("py3-none-any").is_some());
        assert!(platform.compatibility("cp311-cp311-win_amd64").is_none());
        assert!(
            platform.compatibility("cp311-cp311-manylinux_2_17_x86_64").unwrap()
                > platform.compatibility("py3-none-any").unwrap()
        );
    }

    #[test]
    fn test_max_compatibility() {
        let platform = WheelPlatform::new(["cp311-abi3-manylinux_2_17_x86_64", "py3-none-any"]);
        let wheel_tags = ["py2-none-any".to_string(), "py3-none-any".to_string()];
        assert_eq!(
            platform.max_compatibility(&wheel_tags),
            platform.compatibility("py3-none-any")
        );
    }
}
