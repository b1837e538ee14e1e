//! Discovery of V4L2 capture nodes, independent of any open session.

use crate::driver::{DeviceCaps, Driver, V4l2Driver};
use crate::quirks::{self, SYSFS_VIDEO4LINUX};
use serde::Serialize;
use std::io;
use std::path::Path;

/// One capture device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceRecord {
    /// Position in this scan's result.
    pub index: usize,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus_info: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceRecord {
    /// Whether the quirk database lists this device as a stereo camera.
    pub fn is_stereo(&self) -> bool {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => quirks::is_stereo_product(vid, pid),
            _ => false,
        }
    }

    /// `vvvv:pppp`, or `-` for non-USB devices.
    pub fn usb_id(&self) -> String {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            _ => "-".to_string(),
        }
    }
}

/// Scan `/dev/video*` for capture devices, sorted by node number.
pub fn enumerate() -> Vec<DeviceRecord> {
    enumerate_in(Path::new("/dev"), Path::new(SYSFS_VIDEO4LINUX), |path| {
        let path = path.to_str().ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        V4l2Driver::open(path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .query_caps()
    })
}

/// Scan `dev_dir` for `videoN` nodes, asking `query_caps` for each one's caps.
///
/// Nodes that fail to answer, or that cannot capture, are skipped.
pub fn enumerate_in<F>(dev_dir: &Path, sys_root: &Path, query_caps: F) -> Vec<DeviceRecord>
where
    F: Fn(&Path) -> io::Result<DeviceCaps>,
{
    let entries = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dev_dir.display(), error = %e, "cannot scan for video nodes");
            return Vec::new();
        }
    };

    let mut nodes: Vec<(u32, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let number = name.strip_prefix("video")?.parse::<u32>().ok()?;
            Some((number, name))
        })
        .collect();
    nodes.sort_unstable();

    let mut records = Vec::new();
    for (_, name) in nodes {
        let path = dev_dir.join(&name);
        let caps = match query_caps(&path) {
            Ok(caps) => caps,
            Err(e) => {
                tracing::debug!(device = %path.display(), error = %e, "skipping node");
                continue;
            }
        };
        if !caps.video_capture {
            tracing::debug!(device = %path.display(), "skipping non-capture node");
            continue;
        }

        let ids = quirks::usb_ids_in(sys_root, &name);
        records.push(DeviceRecord {
            index: records.len(),
            path: path.to_string_lossy().into_owned(),
            name: caps.card,
            driver: caps.driver,
            bus_info: caps.bus_info,
            vendor_id: ids.map(|(vid, _)| vid),
            product_id: ids.map(|(_, pid)| pid),
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirks::tests::scratch_dir;

    fn fake_caps(path: &Path) -> io::Result<DeviceCaps> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        match name {
            // Metadata node of the same camera.
            "video1" => Ok(DeviceCaps {
                driver: "uvcvideo".into(),
                card: "See3CAM_Tara".into(),
                bus_info: "usb-0000:00:14.0-1".into(),
                video_capture: false,
                streaming: true,
            }),
            "video3" => Err(io::Error::from_raw_os_error(libc::ENODEV)),
            _ => Ok(DeviceCaps {
                driver: "uvcvideo".into(),
                card: format!("cam {name}"),
                bus_info: format!("usb-{name}"),
                video_capture: true,
                streaming: true,
            }),
        }
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let dev = scratch_dir("enum-dev");
        for name in ["video10", "video2", "video0", "video1", "video3", "videoX", "null"] {
            std::fs::write(dev.join(name), b"").unwrap();
        }
        let sys = scratch_dir("enum-sys");

        let records = enumerate_in(&dev, &sys, fake_caps);
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["cam video0", "cam video2", "cam video10"]);
        assert_eq!(
            records.iter().map(|r| r.index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert!(records.iter().all(|r| r.vendor_id.is_none()));
        assert_eq!(records[0].usb_id(), "-");
        assert!(!records[0].is_stereo());

        let _ = std::fs::remove_dir_all(dev);
        let _ = std::fs::remove_dir_all(sys);
    }

    #[test]
    fn test_usb_ids_attached() {
        let dev = scratch_dir("enum-usb-dev");
        std::fs::write(dev.join("video0"), b"").unwrap();

        let sys = scratch_dir("enum-usb-sys");
        let usb_dev = sys.join("bus/1-2");
        let iface = usb_dev.join("1-2:1.0");
        std::fs::create_dir_all(&iface).unwrap();
        std::fs::write(usb_dev.join("idVendor"), "2560\n").unwrap();
        std::fs::write(usb_dev.join("idProduct"), "c114\n").unwrap();
        let class = sys.join("video4linux");
        std::fs::create_dir_all(class.join("video0")).unwrap();
        std::os::unix::fs::symlink(&iface, class.join("video0/device")).unwrap();

        let records = enumerate_in(&dev, &class, fake_caps);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usb_id(), "2560:c114");
        assert!(records[0].is_stereo());

        let _ = std::fs::remove_dir_all(dev);
        let _ = std::fs::remove_dir_all(sys);
    }

    #[test]
    fn test_repeated_scans_equal() {
        let dev = scratch_dir("enum-repeat");
        std::fs::write(dev.join("video4"), b"").unwrap();
        std::fs::write(dev.join("video5"), b"").unwrap();
        let first = enumerate_in(&dev, &dev, fake_caps);
        let second = enumerate_in(&dev, &dev, fake_caps);
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(dev);
    }

    #[test]
    fn test_missing_dev_dir_is_empty() {
        let dev = scratch_dir("enum-missing").join("nope");
        assert!(enumerate_in(&dev, &dev, fake_caps).is_empty());
    }

    #[test]
    fn test_serializes_to_json() {
        let record = DeviceRecord {
            index: 0,
            path: "/dev/video0".into(),
            name: "See3CAM_Tara".into(),
            driver: "uvcvideo".into(),
            bus_info: "usb-1".into(),
            vendor_id: Some(0x2560),
            product_id: Some(0xc114),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["vendor_id"], 9568);
        assert_eq!(json["path"], "/dev/video0");
    }
}
