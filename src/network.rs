/*
 * Copyright 2019 DTAI Research Group - KU Leuven.
 * License: Apache License 2.0
 * Author: Laurens Devos
*/

use std::sync::{Arc, Barrier, Mutex};

use byteorder::{ByteOrder, LittleEndian};

/// Collective, blocking allgather over byte ranges: rank `i` contributes
/// `lens[i]` bytes at offset `starts[i]` and every rank receives the full
/// concatenation. Every rank must reach each call in the same iteration.
pub trait Allgather {
    fn rank(&self) -> usize;
    fn num_machines(&self) -> usize;
    fn allgather(&self, input: &[u8], starts: &[usize], lens: &[usize], output: &mut [u8])
        -> Result<(), String>;
}

/// The single-machine identity network.
pub struct LocalNetwork;

impl Allgather for LocalNetwork {
    fn rank(&self) -> usize { 0 }
    fn num_machines(&self) -> usize { 1 }

    fn allgather(&self, input: &[u8], starts: &[usize], lens: &[usize], output: &mut [u8])
        -> Result<(), String>
    {
        check_layout(input, starts, lens, output, 0, 1)?;
        output[starts[0]..starts[0] + lens[0]].copy_from_slice(input);
        Ok(())
    }
}

struct SharedBuffer {
    barrier: Barrier,
    buffer: Mutex<Vec<u8>>,
}

/// An allgather over threads of one process, for tests and local simulation of
/// the distributed path.
pub struct InProcessNetwork {
    rank: usize,
    num_machines: usize,
    shared: Arc<SharedBuffer>,
}

impl InProcessNetwork {
    /// One connected handle per participating thread.
    pub fn create(num_machines: usize) -> Vec<InProcessNetwork> {
        let shared = Arc::new(SharedBuffer {
            barrier: Barrier::new(num_machines),
            buffer: Mutex::new(Vec::new()),
        });
        (0..num_machines)
            .map(|rank| InProcessNetwork { rank, num_machines, shared: Arc::clone(&shared) })
            .collect()
    }
}

impl Allgather for InProcessNetwork {
    fn rank(&self) -> usize { self.rank }
    fn num_machines(&self) -> usize { self.num_machines }

    fn allgather(&self, input: &[u8], starts: &[usize], lens: &[usize], output: &mut [u8])
        -> Result<(), String>
    {
        check_layout(input, starts, lens, output, self.rank, self.num_machines)?;
        {
            let mut buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() < output.len() {
                buffer.resize(output.len(), 0);
            }
            let start = starts[self.rank];
            buffer[start..start + input.len()].copy_from_slice(input);
        }
        self.shared.barrier.wait();
        {
            let buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            output.copy_from_slice(&buffer[..output.len()]);
        }
        // everyone must have read before the buffer is reused
        self.shared.barrier.wait();
        Ok(())
    }
}

fn check_layout(input: &[u8], starts: &[usize], lens: &[usize], output: &[u8],
                rank: usize, num_machines: usize)
    -> Result<(), String>
{
    if starts.len() != num_machines || lens.len() != num_machines {
        return Err(format!("allgather layout describes {} machines, expected {}",
                   starts.len(), num_machines));
    }
    if input.len() != lens[rank] {
        return Err(format!("allgather input is {} bytes, layout says {}",
                   input.len(), lens[rank]));
    }
    let total: usize = lens.iter().sum();
    if output.len() < total {
        return Err(format!("allgather output is {} bytes, layout needs {}",
                   output.len(), total));
    }
    Ok(())
}

/// Max-reduction of one integer across all ranks, built on the allgather.
pub fn sync_up_by_max(network: &dyn Allgather, value: u32) -> Result<u32, String> {
    let num_machines = network.num_machines();
    if num_machines <= 1 {
        return Ok(value);
    }
    let mut input = [0u8; 4];
    LittleEndian::write_u32(&mut input, value);
    let starts: Vec<usize> = (0..num_machines).map(|i| 4 * i).collect();
    let lens = vec![4; num_machines];
    let mut output = vec![0u8; 4 * num_machines];
    network.allgather(&input, &starts, &lens, &mut output)?;
    Ok((0..num_machines)
        .map(|i| LittleEndian::read_u32(&output[4 * i..4 * i + 4]))
        .fold(0, u32::max))
}




// ------------------------------------------------------------------------------------------------
