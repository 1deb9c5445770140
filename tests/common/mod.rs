//! Shared fixtures: scratch maps and images, and a fake recovery tool.
#![allow(dead_code)]

use rescuefs::RecoveryConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Stand-in for the recovery tool.
///
/// Arguments after the three positional paths: log file, behaviour, then the
/// mode flags. Targeted runs log `targeted POS SIZE` and then:
/// - `hang`: run until interrupted
/// - `finish:TOTAL`: rewrite the map with the range finished, exit 0
/// - `bad:TOTAL`: rewrite the map with the range as bad sectors, exit 0
/// - `fail`: exit 3
///
/// Background runs log `background` and run until interrupted, except with
/// `crash-background`, where they exit 3 at once. A lock directory next to the
/// log detects two runs alive at the same time, and every command line is
/// appended to `<log>.args`.
const FAKE_TOOL: &str = r#"
echo "$*" >> "$3.args"
image=$1
map=$2
log=$3
behaviour=$4
shift 4
pos=
size=
while [ $# -gt 0 ]; do
    case "$1" in
        --input-position) pos=$2; shift ;;
        --size) size=$2; shift ;;
    esac
    shift
done

lock="$log.lock"
finish() {
    rmdir "$lock" 2>/dev/null
    exit "$1"
}
trap 'finish 0' INT
if ! mkdir "$lock" 2>/dev/null; then
    echo overlap >> "$log.violations"
fi

write_map() {
    total=$1
    status=$2
    end=$((pos + size))
    {
        printf '0x%x ?\n' "$pos"
        if [ "$pos" -gt 0 ]; then printf '0x0 0x%x ?\n' "$pos"; fi
        printf '0x%x 0x%x %s\n' "$pos" "$size" "$status"
        if [ "$end" -lt "$total" ]; then printf '0x%x 0x%x ?\n' "$end" $((total - end)); fi
    } > "$map.tmp"
    mv "$map.tmp" "$map"
}

if [ -z "$size" ]; then
    if [ "$behaviour" = crash-background ]; then
        finish 3
    fi
    echo background >> "$log"
    while :; do sleep 0.05; done
fi

echo "targeted $pos $size" >> "$log"
case "$behaviour" in
    hang) while :; do sleep 0.05; done ;;
    finish:*) write_map "${behaviour#finish:}" + ; finish 0 ;;
    bad:*) write_map "${behaviour#bad:}" - ; finish 0 ;;
    fail) finish 3 ;;
    *) finish 0 ;;
esac
"#;

pub struct Scratch {
    pub dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write_map(&self, body: &str) -> PathBuf {
        let path = self.path("image.map");
        fs::write(&path, body).unwrap();
        path
    }

    /// Image filled with a recognisable pattern.
    pub fn write_image(&self, len: usize) -> (PathBuf, Vec<u8>) {
        let path = self.path("image.img");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    /// Config running the fake tool with `behaviour`.
    ///
    /// The script is handed to `sh` in the source position rather than
    /// executed directly, so it never has to be marked executable.
    pub fn fake_tool(&self, behaviour: &str) -> RecoveryConfig {
        let script = self.path("fake-ddrescue.sh");
        fs::write(&script, FAKE_TOOL).unwrap();

        RecoveryConfig::new(script, self.path("image.img"), self.path("image.map"))
            .with_program("/bin/sh")
            .with_extra_args([self.log_path().to_string_lossy().into_owned(), behaviour.to_string()])
    }

    pub fn log_path(&self) -> PathBuf {
        self.path("tool.log")
    }

    pub fn log_lines(&self) -> Vec<String> {
        read_lines(&self.log_path())
    }

    pub fn targeted_runs(&self) -> Vec<String> {
        self.log_lines()
            .into_iter()
            .filter(|line| line.starts_with("targeted"))
            .collect()
    }

    pub fn violations(&self) -> Vec<String> {
        read_lines(&self.log_sibling(".violations"))
    }

    pub fn invocations(&self) -> Vec<String> {
        read_lines(&self.log_sibling(".args"))
    }

    fn log_sibling(&self, suffix: &str) -> PathBuf {
        let mut path = self.log_path().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Polls `cond` until it holds or five seconds pass.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Whether a process with this pid still exists.
pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
