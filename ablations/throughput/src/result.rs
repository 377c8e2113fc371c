//! 实验结果.

use crate::profile::Profile;
use std::io::{self, Write};

/// 将 `p` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.3}"),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Profile `{name}`:")?;
    writeln!(w, "{S4}Batches: {}", p.get_batches())?;
    writeln!(w, "{S4}Samples: {}", p.get_samples())?;
    writeln!(w, "{S4}Total machine time: {} us", p.get_real_time_us())?;
    writeln!(w, "{S4}Total waiting time: {} us", p.get_wait_time_us())?;
    writeln!(w, "{S4}Average waiting time: {} us", f64_to_display(p.get_avg_wait_us()))?;
    writeln!(w, "{S4}Throughput: {} samples/s", f64_to_display(p.get_samples_per_sec()))?;
    let t = p.get_longest_wait().map(|d| d.as_micros() as f64);
    write!(w, "{S4}Longest wait: {} us", f64_to_display(t))?;
    Ok(())
}

/// 吞吐量实验最终结果.
pub struct AblationResult {
    data: Vec<(String, Profile)>,
}

impl FromIterator<(String, Profile)> for AblationResult {
    fn from_iter<I: IntoIterator<Item = (String, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }
}

impl AblationResult {
    /// 打印运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut buf).expect("writing into a Vec");
            println!("{}", String::from_utf8_lossy(&buf));
            buf.clear();

            utils::sep();
        }
    }
}
