use std::{fs, io};

/// Fields of `/proc/<pid>/stat` the governor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: u32,
    pub tcomm: String,
    pub state: char,
    pub ppid: u32,
    pub pgrp: i32,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u64,
    /// Resident set size in pages.
    pub rss: u64,
}

impl ProcessStat {
    /// Parses one stat line. The command name may itself contain spaces
    /// and parentheses, so fields are counted from the last `)`.
    pub fn parse(content: &str) -> Option<Self> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let pid = content[..open].trim().parse().ok()?;
        let tcomm = content.get(open + 1..close)?.to_string();
        let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
        if rest.len() < 22 {
            return None;
        }
        Some(Self {
            pid,
            tcomm,
            state: rest[0].chars().next()?,
            ppid: rest[1].parse().ok()?,
            pgrp: rest[2].parse().ok()?,
            utime: rest[11].parse().ok()?,
            stime: rest[12].parse().ok()?,
            num_threads: rest[17].parse().ok()?,
            rss: rest[21].parse().ok()?,
        })
    }
}

pub fn read_stat(pid: u32) -> Option<ProcessStat> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    ProcessStat::parse(&content)
}

/// Watches every process of one process group.
pub struct GroupProbe {
    pgid: i32,
    page_size: u64,
}

impl GroupProbe {
    pub fn new(pgid: u32) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            pgid: pgid as i32,
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }

    pub fn members(&self) -> Vec<ProcessStat> {
        let entries = match fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(read_stat)
            .filter(|stat| stat.pgrp == self.pgid)
            .collect()
    }

    /// Resident memory summed across the live members of the group.
    pub fn resident_bytes(&self) -> u64 {
        self.members()
            .iter()
            .filter(|stat| stat.state != 'Z')
            .map(|stat| stat.rss * self.page_size)
            .sum()
    }

    /// Sends SIGKILL to the whole group. A group that is already gone is not an error.
    pub fn kill(&self) -> io::Result<()> {
        kill_group(self.pgid as u32)
    }
}

pub fn kill_group(pgid: u32) -> io::Result<()> {
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Exit status and resource usage of a reaped process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessBio {
    status: i32,
    utime: u64,
    stime: u64,
    maxrss: u64,
}

impl ProcessBio {
    pub fn exit_code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.status) {
            Some(libc::WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    pub fn signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.status) {
            Some(libc::WTERMSIG(self.status))
        } else {
            None
        }
    }

    /// CPU time (ms), user and system.
    pub fn get_time_usage(&self) -> u64 {
        self.utime + self.stime
    }

    /// Peak resident memory of the reaped process in bytes.
    pub fn get_peak_memory(&self) -> u64 {
        self.maxrss * 1024
    }
}

fn wait(pid: u32, flags: libc::c_int) -> io::Result<Option<ProcessBio>> {
    let mut status: libc::c_int = 0;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, flags, &mut ru) };
        if rc == 0 {
            return Ok(None);
        }
        if rc > 0 {
            return Ok(Some(ProcessBio {
                status,
                utime: (ru.ru_utime.tv_sec * 1000 + ru.ru_utime.tv_usec / 1000) as u64,
                stime: (ru.ru_stime.tv_sec * 1000 + ru.ru_stime.tv_usec / 1000) as u64,
                maxrss: ru.ru_maxrss.max(0) as u64,
            }));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reaps `pid` if it has terminated, without blocking.
pub fn try_reap(pid: u32) -> io::Result<Option<ProcessBio>> {
    wait(pid, libc::WNOHANG)
}

/// Blocks until `pid` terminates and reaps it.
pub fn reap(pid: u32) -> io::Result<ProcessBio> {
    match wait(pid, 0)? {
        Some(bio) => Ok(bio),
        None => Err(io::Error::new(io::ErrorKind::Other, "wait4 returned no child")),
    }
}
